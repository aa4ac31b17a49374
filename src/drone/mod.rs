//! 工蜂(Drone)会话实现模块

pub mod network;
pub mod session;

pub use network::{Connection, ConnectionError, TcpConnection};
pub use session::{DroneSession, SessionId};
