//! HiveSched 核心库入口
//!
//! 拉取式任务调度：drone 通过持久连接声明自己能执行的 function，
//! 发送 `grab` 后由 queen 把匹配的任务推送回连接。

pub mod config;
pub mod drone;
pub mod job;
pub mod proto;
pub mod queen;

use crate::drone::network::ConnectionError;
use crate::job::{JobId, StoreError};
use crate::proto::ProtoError;

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("协议错误: {0}")]
    Proto(#[from] ProtoError),

    #[error("连接错误: {0}")]
    Connection(#[from] ConnectionError),

    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    #[error("任务 {0} 不属于当前会话")]
    NotOwned(JobId),

    #[error("会话已关闭")]
    SessionDead,

    #[error("调度器已停止")]
    SchedulerStopped,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("I/O错误: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// 是否必须终止当前会话
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::SessionDead | BrokerError::SchedulerStopped
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

// 公开导出模块的公共接口
pub use config::{BrokerConfig, DisconnectPolicy};
pub use drone::network::{Connection, TcpConnection};
pub use drone::session::{DroneSession, SessionId};
pub use job::{Job, JobStatus, JobStore, MemoryStore};
pub use proto::{Command, Reply};
pub use queen::{Queen, QueenStats};
