//! 帧协议: 以 NUL 分隔的命令帧

mod command;

pub use command::{decode, Command, ProtoError, Reply, NULL_CHAR};
