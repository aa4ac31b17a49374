//! Drone 会话 - 每个连接一个协议循环
//!
//! 会话独占自己的 function 集合和在途任务集合，queen 只通过
//! `dispatch` 推送任务，从不直接改动它们。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::drone::network::Connection;
use crate::job::{Job, JobId};
use crate::proto::{self, Command, Reply};
use crate::queen::Queen;
use crate::{BrokerError, Result};

/// 会话标识类型
pub type SessionId = Uuid;

/// 单个 drone 连接在 queen 侧的状态
pub struct DroneSession {
    id: SessionId,
    conn: Box<dyn Connection>,
    queen: Queen,
    // 回复和任务推送来自不同线程，写出必须串行
    send_lock: Mutex<()>,
    functions: Mutex<BTreeSet<String>>,
    inflight: Mutex<Vec<JobId>>,
    alive: AtomicBool,
}

impl DroneSession {
    pub fn new(queen: Queen, conn: Box<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            conn,
            queen,
            send_lock: Mutex::new(()),
            functions: Mutex::new(BTreeSet::new()),
            inflight: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        })
    }

    /// 在独立线程上运行协议循环
    pub fn spawn(queen: Queen, conn: Box<dyn Connection>) -> std::io::Result<thread::JoinHandle<()>> {
        let session = Self::new(queen, conn);
        thread::Builder::new()
            .name(format!("drone-{}", session.id))
            .spawn(move || session.run())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn functions(&self) -> Vec<String> {
        self.functions.lock().iter().cloned().collect()
    }

    /// 已分派但尚未确认的任务，按分派顺序
    pub fn inflight(&self) -> Vec<JobId> {
        self.inflight.lock().clone()
    }

    /// 协议循环：读一帧、解码、处理，直到传输出错或会话被标记为死亡
    pub fn run(self: Arc<Self>) {
        info!("Drone session {} opened", self.id);
        while self.is_alive() {
            let frame = match self.conn.receive() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Drone session {} receive failed: {}", self.id, e);
                    break;
                }
            };

            let result = match proto::decode(&frame) {
                Ok(cmd) => self.handle(cmd),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => {}
                Err(BrokerError::Proto(e)) => {
                    warn!("Drone session {} sent malformed frame: {}", self.id, e);
                    metrics::counter!("hive_frames_malformed").increment(1);
                }
                Err(e) if e.is_fatal() => {
                    error!("Drone session {} failed: {}", self.id, e);
                    break;
                }
                Err(e) => warn!("Drone session {} command failed: {}", self.id, e),
            }
        }
        self.teardown();
    }

    /// 处理一条命令
    pub fn handle(self: &Arc<Self>, cmd: Command) -> Result<()> {
        debug!("Drone session {} <- {:?}", self.id, cmd);
        match cmd {
            Command::Grab => self.queen.grab(Arc::clone(self)),
            Command::Done(job_id) => self.finish(job_id, |queen, id, job| queen.report_done(id, job)),
            Command::Fail(job_id) => self.finish(job_id, |queen, id, job| queen.report_fail(id, job)),
            Command::SchedLater { job_id, delay } => {
                self.finish(job_id, |queen, id, job| queen.reschedule(id, job, delay))
            }
            Command::Sleep => self.send(&Reply::Nop),
            Command::Ping => self.send(&Reply::Pong),
            Command::CanDo(func) => {
                if self.functions.lock().insert(func.clone()) {
                    self.queen.register_capability(func, Arc::clone(self))?;
                }
                Ok(())
            }
            Command::CanNoDo(func) => {
                if self.functions.lock().remove(&func) {
                    self.queen.revoke_capability(func, self.id)?;
                }
                Ok(())
            }
            Command::Unknown(name) => {
                debug!("Drone session {} sent unknown command {:?}", self.id, name);
                self.send(&Reply::Unknown)
            }
        }
    }

    /// done/fail/sched_later 的公共流程：先移出在途集合，再上报 queen。
    /// 存储失败时状态未变更，任务放回在途集合。
    fn finish<F>(&self, job_id: JobId, report: F) -> Result<()>
    where
        F: FnOnce(&Queen, SessionId, JobId) -> Result<()>,
    {
        if !self.take_inflight(job_id) {
            warn!("Drone session {} reported job {} it does not hold", self.id, job_id);
            return Ok(());
        }
        match report(&self.queen, self.id, job_id) {
            Err(e @ BrokerError::Store(_)) => {
                self.inflight.lock().push(job_id);
                Err(e)
            }
            other => other,
        }
    }

    fn take_inflight(&self, job_id: JobId) -> bool {
        let mut inflight = self.inflight.lock();
        match inflight.iter().position(|id| *id == job_id) {
            Some(pos) => {
                inflight.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 推送任务给 drone，由 queen 在匹配时调用。
    ///
    /// 发送失败时任务不算送达，从在途集合移除并关闭会话，
    /// 调用方负责让任务重新进入可分派池。
    pub(crate) fn dispatch(&self, job: &Job) -> Result<()> {
        let frame = job.pack()?;
        {
            // 与 teardown 共用同一把锁，死亡会话不会再收下任务
            let mut inflight = self.inflight.lock();
            if !self.is_alive() {
                return Err(BrokerError::SessionDead);
            }
            inflight.push(job.id);
        }

        if let Err(e) = self.send(&Reply::Dispatch(frame)) {
            self.take_inflight(job.id);
            self.kill();
            return Err(e);
        }
        info!("Dispatched job {} ({}) to drone session {}", job.id, job.function, self.id);
        Ok(())
    }

    pub(crate) fn send(&self, reply: &Reply) -> Result<()> {
        let _guard = self.send_lock.lock();
        self.conn.send(&reply.encode())?;
        Ok(())
    }

    /// 标记会话死亡并关闭连接，阻塞中的 receive 随之返回
    pub(crate) fn kill(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.conn.close();
        }
    }

    fn teardown(&self) {
        let orphaned = {
            let mut inflight = self.inflight.lock();
            self.alive.store(false, Ordering::SeqCst);
            std::mem::take(&mut *inflight)
        };
        self.conn.close();

        if !orphaned.is_empty() {
            warn!("Drone session {} closed holding jobs {:?}", self.id, orphaned);
        }
        if let Err(e) = self.queen.remove_session(self.id, orphaned) {
            error!("Drone session {} cleanup failed: {}", self.id, e);
        }
        info!("Drone session {} closed", self.id);
    }
}

impl fmt::Debug for DroneSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DroneSession")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("functions", &*self.functions.lock())
            .field("inflight", &*self.inflight.lock())
            .finish()
    }
}
