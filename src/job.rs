//! 任务记录与存储协作接口

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 任务标识类型，由存储分配
pub type JobId = i64;

/// 任务状态
///
/// `queued -> doing -> {done, failed, sched_later}`，`sched_later` 到期后回到 `queued`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Doing,
    Done,
    Failed,
    SchedLater,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Doing => write!(f, "doing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::SchedLater => write!(f, "sched_later"),
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// 执行该任务所需的 function
    pub function: String,
    /// 交给 drone 的不透明负载
    pub payload: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `sched_later` 状态下预计重新入队的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_at: Option<DateTime<Utc>>,
}

impl Job {
    /// 创建一个 `queued` 状态的新任务
    pub fn new(id: JobId, function: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            function: function.into(),
            payload: payload.into(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            sched_at: None,
        }
    }

    /// 返回状态迁移后的副本，原记录保持不变直到存储确认
    pub fn transitioned(&self, status: JobStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        if status != JobStatus::SchedLater {
            next.sched_at = None;
        }
        next
    }

    /// 打包为分派帧
    pub fn pack(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn unpack(frame: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// 存储错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// 任务持久化协作接口
///
/// `save` 必须同步且持久，返回前状态已落盘。
pub trait JobStore: Send + Sync {
    fn load(&self, id: JobId) -> Result<Job, StoreError>;

    fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// 所有非终态任务，启动恢复时使用
    fn pending(&self) -> Result<Vec<Job>, StoreError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    next_id: AtomicI64,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配 id 并保存一个 `queued` 任务
    pub fn create(&self, function: &str, payload: &str) -> Result<Job, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job::new(id, function, payload);
        self.save(&job)?;
        Ok(job)
    }

    /// 之后的 `save` 全部失败，测试用
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.read().get(&id).map(|job| job.status)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

impl JobStore for MemoryStore {
    fn load(&self, id: JobId) -> Result<Job, StoreError> {
        self.jobs.read().get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn save(&self, job: &Job) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("save of job {} rejected", job.id)));
        }
        let mut jobs = self.jobs.write();
        jobs.insert(job.id, job.clone());
        // 外部写入的 id 也要推进分配器
        self.next_id.fetch_max(job.id, Ordering::SeqCst);
        Ok(())
    }

    fn pending(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}
