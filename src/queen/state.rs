//! 调度线程独占的状态与匹配循环

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use super::{QueenStats, Request};
use crate::config::{BrokerConfig, DisconnectPolicy};
use crate::drone::session::{DroneSession, SessionId};
use crate::job::{Job, JobId, JobStatus, JobStore, StoreError};
use crate::proto::Reply;
use crate::{BrokerError, Result};

/// 存储写入失败后重试重新入队的最小间隔
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// 超出 `Instant` 表示范围的延迟按一年处理
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// 任务表条目
#[derive(Debug)]
struct Entry {
    job: Job,
    /// 持有该任务的会话，`Some` 时任务不在可分派池中
    owner: Option<SessionId>,
    /// 提交顺序，跨 function 比较任务新旧
    seq: u64,
}

pub(super) struct QueenState {
    store: Arc<dyn JobStore>,
    config: BrokerConfig,
    sessions: HashMap<SessionId, Arc<DroneSession>>,
    capabilities: HashMap<String, BTreeSet<SessionId>>,
    session_functions: HashMap<SessionId, BTreeSet<String>>,
    grab_queue: VecDeque<SessionId>,
    // 本次 grab 已收到 no_job/wait_for_job 的会话
    answered: HashSet<SessionId>,
    jobs: HashMap<JobId, Entry>,
    ready: HashMap<String, VecDeque<(u64, JobId)>>,
    next_seq: u64,
    // 到期时间和到期后要写入的状态
    deadlines: HashMap<JobId, (Instant, JobStatus)>,
    timers: BinaryHeap<Reverse<(Instant, JobId)>>,
    dirty: bool,
}

impl QueenState {
    pub(super) fn new(store: Arc<dyn JobStore>, config: BrokerConfig) -> Self {
        Self {
            store,
            config,
            sessions: HashMap::new(),
            capabilities: HashMap::new(),
            session_functions: HashMap::new(),
            grab_queue: VecDeque::new(),
            answered: HashSet::new(),
            jobs: HashMap::new(),
            ready: HashMap::new(),
            next_seq: 0,
            deadlines: HashMap::new(),
            timers: BinaryHeap::new(),
            dirty: false,
        }
    }

    pub(super) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 从存储恢复未完成任务。上个进程遗留的 `doing` 没有存活的会话持有，重新入队。
    pub(super) fn recover(&mut self) -> Result<()> {
        let pending = self.store.pending()?;
        let now = Utc::now();
        let count = pending.len();

        for job in pending {
            let id = job.id;
            let status = job.status;
            let sched_at = job.sched_at;
            self.insert(job);
            match status {
                JobStatus::Queued => self.push_ready(id),
                JobStatus::Doing => self.requeue(id),
                JobStatus::SchedLater => {
                    // 按持久化的 sched_at 补足剩余延迟，已过期的立即入队
                    let remaining = sched_at
                        .and_then(|at| (at - now).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    self.arm(id, remaining, JobStatus::Queued);
                }
                JobStatus::Done | JobStatus::Failed => {
                    self.jobs.remove(&id);
                }
            }
        }
        info!("Recovered {} unfinished jobs from store", count);
        Ok(())
    }

    /// 调度主循环
    pub(super) fn run(mut self, rx: Receiver<Request>) {
        info!("Queen dispatcher running");
        self.dirty = true;
        loop {
            let first = match self.next_deadline() {
                Some(at) => match rx.recv_deadline(at) {
                    Ok(request) => Some(request),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(request) => Some(request),
                    Err(_) => break,
                },
            };

            let mut stop = first.map_or(false, |request| self.handle(request));
            while !stop {
                match rx.try_recv() {
                    Ok(request) => stop = self.handle(request),
                    Err(_) => break,
                }
            }
            if stop {
                break;
            }

            self.fire_timers(Instant::now());
            // 分派失败会把任务放回池中并再次置位
            while self.dirty {
                self.dirty = false;
                self.match_jobs();
            }
        }

        for session in self.sessions.values() {
            session.kill();
        }
        info!("Queen dispatcher stopped");
    }

    /// 处理一个请求，返回 true 表示停止
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Submit(job) => self.submit(job),
            Request::RegisterCapability { function, session } => {
                self.register_capability(function, session)
            }
            Request::RevokeCapability { function, session } => {
                self.revoke_capability(&function, session)
            }
            Request::Grab(session) => self.grab(session),
            Request::Notify => self.dirty = true,
            Request::Done { session, job_id, reply } => {
                let _ = reply.send(self.finish(session, job_id, JobStatus::Done));
            }
            Request::Fail { session, job_id, reply } => {
                let _ = reply.send(self.finish(session, job_id, JobStatus::Failed));
            }
            Request::SchedLater {
                session,
                job_id,
                delay,
                reply,
            } => {
                let _ = reply.send(self.reschedule(session, job_id, delay));
            }
            Request::RemoveSession { session, inflight } => self.remove_session(session, inflight),
            Request::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Request::Shutdown => return true,
        }
        false
    }

    fn submit(&mut self, job: Job) {
        if self.jobs.contains_key(&job.id) {
            warn!("Job {} already known, submit ignored", job.id);
            return;
        }
        if job.status != JobStatus::Queued {
            warn!("Job {} submitted in status {}, expected queued", job.id, job.status);
            return;
        }
        debug!("Job {} ({}) submitted", job.id, job.function);
        let id = job.id;
        self.insert(job);
        self.push_ready(id);
    }

    fn register_capability(&mut self, function: String, session: Arc<DroneSession>) {
        if !session.is_alive() {
            return;
        }
        let id = session.id();
        debug!("Session {} can do {}", id, function);
        self.sessions.insert(id, session);
        self.capabilities.entry(function.clone()).or_default().insert(id);
        self.session_functions.entry(id).or_default().insert(function);
        // 已在 grab 队列中的会话可能因此有了可做的任务
        self.dirty = true;
    }

    fn revoke_capability(&mut self, function: &str, session: SessionId) {
        debug!("Session {} can no longer do {}", session, function);
        if let Some(members) = self.capabilities.get_mut(function) {
            members.remove(&session);
            if members.is_empty() {
                self.capabilities.remove(function);
            }
        }
        if let Some(functions) = self.session_functions.get_mut(&session) {
            functions.remove(function);
        }
    }

    fn grab(&mut self, session: Arc<DroneSession>) {
        if !session.is_alive() {
            return;
        }
        let id = session.id();
        self.sessions.insert(id, session);
        if !self.grab_queue.contains(&id) {
            self.grab_queue.push_back(id);
        }
        // 新的 grab 重新获得一次 no_job/wait_for_job 应答
        self.answered.remove(&id);
        self.dirty = true;
    }

    /// done/fail 上报：终态写入存储后，调度器丢弃自己的引用
    fn finish(&mut self, session: SessionId, job_id: JobId, status: JobStatus) -> Result<()> {
        self.check_owner(session, job_id)?;
        self.transition(job_id, status)?;
        self.jobs.remove(&job_id);

        match status {
            JobStatus::Done => metrics::counter!("hive_jobs_done").increment(1),
            _ => metrics::counter!("hive_jobs_failed").increment(1),
        }
        info!("Job {} finished as {} by session {}", job_id, status, session);
        Ok(())
    }

    /// 标记为 `sched_later`，到期后重新入队。重复调用以最后一次的延迟为准。
    fn reschedule(&mut self, session: SessionId, job_id: JobId, delay: u64) -> Result<()> {
        self.check_owner(session, job_id)?;
        let wait = self.config.delay(delay);

        let mut next = self.job(job_id)?.transitioned(JobStatus::SchedLater);
        next.sched_at = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.commit(next)?;

        if let Some(entry) = self.jobs.get_mut(&job_id) {
            entry.owner = None;
        }
        self.arm(job_id, wait, JobStatus::Queued);
        metrics::counter!("hive_jobs_rescheduled").increment(1);
        info!("Job {} rescheduled in {:?}", job_id, wait);
        Ok(())
    }

    fn remove_session(&mut self, session: SessionId, inflight: Vec<JobId>) {
        self.sessions.remove(&session);
        self.grab_queue.retain(|id| *id != session);
        self.answered.remove(&session);
        if let Some(functions) = self.session_functions.remove(&session) {
            for function in functions {
                self.revoke_capability(&function, session);
            }
        }

        // 以调度器记录的持有关系为准，会话报告的在途集合只用于核对
        let mut owned: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session))
            .map(|(id, _)| *id)
            .collect();
        owned.sort_unstable();
        for id in inflight.iter().filter(|id| !owned.contains(id)) {
            debug!("Job {} of session {} was already released", id, session);
        }

        info!("Session {} removed, reclaiming jobs {:?}", session, owned);
        for id in owned {
            self.release(id);
        }
        metrics::gauge!("hive_grab_queue_len").set(self.grab_queue.len() as f64);
    }

    /// 按断开策略处理失去持有者的任务
    fn release(&mut self, job_id: JobId) {
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            entry.owner = None;
        }
        match self.config.disconnect_policy {
            DisconnectPolicy::Requeue => self.requeue(job_id),
            DisconnectPolicy::Fail => self.fail_orphan(job_id),
        }
    }

    /// 写入终态 `failed`，存储失败时稍后重试同一迁移
    fn fail_orphan(&mut self, job_id: JobId) {
        if !self.jobs.contains_key(&job_id) {
            return;
        }
        match self.transition(job_id, JobStatus::Failed) {
            Ok(()) => {
                self.jobs.remove(&job_id);
                metrics::counter!("hive_jobs_failed").increment(1);
                info!("Job {} failed after losing its session", job_id);
            }
            Err(e) => {
                error!("Failed to mark orphaned job {} failed: {}, retrying", job_id, e);
                self.arm(job_id, self.retry_delay(), JobStatus::Failed);
            }
        }
    }

    /// 写回 `queued` 并放入可分派池，存储失败时稍后重试
    fn requeue(&mut self, job_id: JobId) {
        if !self.jobs.contains_key(&job_id) {
            return;
        }
        match self.transition(job_id, JobStatus::Queued) {
            Ok(()) => {
                self.push_ready(job_id);
                metrics::counter!("hive_jobs_requeued").increment(1);
                info!("Job {} queued", job_id);
            }
            Err(e) => {
                error!("Failed to requeue job {}: {}, retrying", job_id, e);
                self.arm(job_id, self.retry_delay(), JobStatus::Queued);
            }
        }
    }

    /// 匹配：按 grab 队列先后顺序，为每个会话找最早提交的可做任务
    fn match_jobs(&mut self) {
        let mut waiting = VecDeque::with_capacity(self.grab_queue.len());

        while let Some(id) = self.grab_queue.pop_front() {
            let session = match self.sessions.get(&id) {
                Some(session) if session.is_alive() => Arc::clone(session),
                _ => {
                    self.answered.remove(&id);
                    continue;
                }
            };

            if let Some(job_id) = self.take_job_for(id) {
                self.answered.remove(&id);
                self.dispatch(&session, job_id);
                continue;
            }

            if self.answered.insert(id) {
                let reply = if self.ready.values().all(|queue| queue.is_empty()) {
                    Reply::NoJob
                } else {
                    Reply::WaitForJob
                };
                if let Err(e) = session.send(&reply) {
                    warn!("Session {} could not be told {:?}: {}", id, reply, e);
                    session.kill();
                    continue;
                }
            }
            waiting.push_back(id);
        }

        self.grab_queue = waiting;
        metrics::gauge!("hive_grab_queue_len").set(self.grab_queue.len() as f64);
    }

    fn take_job_for(&mut self, session: SessionId) -> Option<JobId> {
        loop {
            let function = {
                let functions = self.session_functions.get(&session)?;
                functions
                    .iter()
                    .filter_map(|f| self.ready.get(f).and_then(|q| q.front()).map(|(seq, _)| (*seq, f)))
                    .min_by_key(|(seq, _)| *seq)
                    .map(|(_, f)| f.clone())?
            };
            let (_, job_id) = self.ready.get_mut(&function)?.pop_front()?;

            // 跳过已不在池中的陈旧条目
            match self.jobs.get(&job_id) {
                Some(entry) if entry.owner.is_none() && entry.job.status == JobStatus::Queued => {
                    return Some(job_id)
                }
                _ => continue,
            }
        }
    }

    /// 把任务交给会话。送达后才写入 `doing`；发送失败的任务没有送达，直接重新入队。
    fn dispatch(&mut self, session: &Arc<DroneSession>, job_id: JobId) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        entry.owner = Some(session.id());
        let job = entry.job.clone();

        match session.dispatch(&job) {
            Ok(()) => {
                metrics::counter!("hive_jobs_dispatched").increment(1);
                if let Err(e) = self.transition(job_id, JobStatus::Doing) {
                    // drone 已经拿到任务，持有关系保留，等它上报结果
                    error!("Job {} delivered but saving doing failed: {}", job_id, e);
                }
            }
            Err(e) => {
                warn!("Dispatch of job {} to session {} failed: {}", job_id, session.id(), e);
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.owner = None;
                }
                self.push_ready(job_id);
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        while let Some(Reverse((at, job_id))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            self.timers.pop();
            // 被后一次 arm 覆盖的旧定时器直接丢弃
            let target = match self.deadlines.get(&job_id) {
                Some(&(deadline, target)) if deadline == at => target,
                _ => continue,
            };
            self.deadlines.remove(&job_id);
            match target {
                JobStatus::Failed => self.fail_orphan(job_id),
                _ => self.requeue(job_id),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((at, _))| *at)
    }

    fn arm(&mut self, job_id: JobId, wait: Duration, target: JobStatus) {
        let now = Instant::now();
        let at = now.checked_add(wait).unwrap_or(now + FAR_FUTURE);
        self.deadlines.insert(job_id, (at, target));
        self.timers.push(Reverse((at, job_id)));
    }

    fn retry_delay(&self) -> Duration {
        self.config.delay(1).max(MIN_RETRY_DELAY)
    }

    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(
            job.id,
            Entry {
                job,
                owner: None,
                seq,
            },
        );
    }

    /// 按提交顺序插入对应 function 的可分派队列
    fn push_ready(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        let queue = self.ready.entry(entry.job.function.clone()).or_default();
        let pos = queue.partition_point(|(seq, _)| *seq < entry.seq);
        queue.insert(pos, (entry.seq, job_id));
        self.dirty = true;
    }

    fn check_owner(&self, session: SessionId, job_id: JobId) -> Result<()> {
        match self.jobs.get(&job_id) {
            Some(entry) if entry.owner == Some(session) => Ok(()),
            _ => Err(BrokerError::NotOwned(job_id)),
        }
    }

    fn job(&self, job_id: JobId) -> Result<&Job> {
        self.jobs
            .get(&job_id)
            .map(|entry| &entry.job)
            .ok_or(BrokerError::Store(StoreError::NotFound(job_id)))
    }

    /// 状态迁移：先写存储，成功后才更新内存
    fn transition(&mut self, job_id: JobId, status: JobStatus) -> Result<()> {
        let next = self.job(job_id)?.transitioned(status);
        self.commit(next)
    }

    fn commit(&mut self, next: Job) -> Result<()> {
        self.store.save(&next)?;
        if let Some(entry) = self.jobs.get_mut(&next.id) {
            entry.job = next;
        }
        Ok(())
    }

    fn stats(&self) -> QueenStats {
        QueenStats {
            sessions: self.sessions.len(),
            grab_queue: self.grab_queue.len(),
            functions: self.capabilities.len(),
            queued: self
                .jobs
                .values()
                .filter(|e| e.owner.is_none() && e.job.status == JobStatus::Queued)
                .count(),
            doing: self.jobs.values().filter(|e| e.owner.is_some()).count(),
            scheduled: self.deadlines.len(),
        }
    }
}
