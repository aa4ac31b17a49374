//! Queen模块实现 - 进程内唯一的调度器
//!
//! 所有共享状态(能力索引、grab 队列、任务表)归一个调度线程独占，
//! 会话通过 `Queen` 句柄把请求发进队列，操作天然互斥。

mod state;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{error, info};
use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::drone::network::Connection;
use crate::drone::session::{DroneSession, SessionId};
use crate::job::{Job, JobId, JobStore};
use crate::{BrokerError, Result};

use self::state::QueenState;

/// 调度器状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueenStats {
    pub sessions: usize,
    pub grab_queue: usize,
    pub functions: usize,
    pub queued: usize,
    pub doing: usize,
    pub scheduled: usize,
}

/// 发给调度线程的请求
pub(crate) enum Request {
    Submit(Job),
    RegisterCapability {
        function: String,
        session: Arc<DroneSession>,
    },
    RevokeCapability {
        function: String,
        session: SessionId,
    },
    Grab(Arc<DroneSession>),
    Notify,
    Done {
        session: SessionId,
        job_id: JobId,
        reply: Sender<Result<()>>,
    },
    Fail {
        session: SessionId,
        job_id: JobId,
        reply: Sender<Result<()>>,
    },
    SchedLater {
        session: SessionId,
        job_id: JobId,
        delay: u64,
        reply: Sender<Result<()>>,
    },
    RemoveSession {
        session: SessionId,
        inflight: Vec<JobId>,
    },
    Stats(Sender<QueenStats>),
    Shutdown,
}

/// 调度器句柄，可在会话之间克隆
#[derive(Clone)]
pub struct Queen {
    tx: Sender<Request>,
    dispatcher: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl Queen {
    /// 启动调度线程。`recover_on_start` 打开时先从存储恢复未完成任务。
    pub fn start(store: Arc<dyn JobStore>, config: BrokerConfig) -> Result<Self> {
        let mut state = QueenState::new(store, config);
        if state.config().recover_on_start {
            state.recover()?;
        }

        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("queen".to_string())
            .spawn(move || state.run(rx))?;
        info!("Queen started");

        Ok(Self {
            tx,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// 为新连接创建会话并在独立线程上运行
    pub fn accept(&self, conn: Box<dyn Connection>) -> Result<thread::JoinHandle<()>> {
        Ok(DroneSession::spawn(self.clone(), conn)?)
    }

    /// 生产者入口，任务须已以 `queued` 状态保存在存储中
    pub fn submit(&self, job: Job) -> Result<()> {
        self.send(Request::Submit(job))
    }

    pub fn register_capability(&self, function: String, session: Arc<DroneSession>) -> Result<()> {
        self.send(Request::RegisterCapability { function, session })
    }

    pub fn revoke_capability(&self, function: String, session: SessionId) -> Result<()> {
        self.send(Request::RevokeCapability { function, session })
    }

    /// 会话进入 grab 队列，不阻塞，任务稍后异步推送
    pub fn grab(&self, session: Arc<DroneSession>) -> Result<()> {
        self.send(Request::Grab(session))
    }

    /// 唤醒一次匹配，多次通知可能合并为一次
    pub fn notify(&self) -> Result<()> {
        self.send(Request::Notify)
    }

    pub fn report_done(&self, session: SessionId, job_id: JobId) -> Result<()> {
        self.call(|reply| Request::Done { session, job_id, reply })?
    }

    pub fn report_fail(&self, session: SessionId, job_id: JobId) -> Result<()> {
        self.call(|reply| Request::Fail { session, job_id, reply })?
    }

    pub fn reschedule(&self, session: SessionId, job_id: JobId, delay: u64) -> Result<()> {
        self.call(|reply| Request::SchedLater {
            session,
            job_id,
            delay,
            reply,
        })?
    }

    /// 会话断开时调用，回收其在途任务
    pub fn remove_session(&self, session: SessionId, inflight: Vec<JobId>) -> Result<()> {
        self.send(Request::RemoveSession { session, inflight })
    }

    pub fn stats(&self) -> Result<QueenStats> {
        self.call(Request::Stats)
    }

    /// 停止调度线程并关闭所有会话连接
    pub fn shutdown(&self) {
        let Some(handle) = self.dispatcher.lock().take() else {
            return;
        };
        if self.tx.send(Request::Shutdown).is_err() {
            error!("Queen dispatcher already gone");
        }
        if handle.join().is_err() {
            error!("Queen dispatcher panicked");
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).map_err(|_| BrokerError::SchedulerStopped)
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = bounded(1);
        self.send(build(reply))?;
        rx.recv().map_err(|_| BrokerError::SchedulerStopped)
    }
}
