use hive_sched::job::StoreError;
use hive_sched::{Job, JobStatus, JobStore, MemoryStore};

#[test]
fn test_memory_store_assigns_ids() {
    let store = MemoryStore::new();
    let a = store.create("build", "a").unwrap();
    let b = store.create("build", "b").unwrap();
    assert_eq!((a.id, b.id), (1, 2));
    assert_eq!(a.status, JobStatus::Queued);

    // 外部写入较大的 id 后，分配器跳过它
    store.save(&Job::new(42, "build", "c")).unwrap();
    assert_eq!(store.create("build", "d").unwrap().id, 43);
    assert_eq!(store.len(), 4);
}

#[test]
fn test_pending_excludes_terminal_jobs() {
    let store = MemoryStore::new();
    let queued = store.create("build", "q").unwrap();
    let done = store.create("build", "d").unwrap().transitioned(JobStatus::Done);
    store.save(&done).unwrap();
    let later = store.create("build", "l").unwrap().transitioned(JobStatus::SchedLater);
    store.save(&later).unwrap();

    let ids: Vec<_> = store.pending().unwrap().iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![queued.id, later.id]);
}

#[test]
fn test_failing_store_keeps_previous_record() {
    let store = MemoryStore::new();
    let job = store.create("build", "x").unwrap();
    store.set_fail_saves(true);

    let result = store.save(&job.transitioned(JobStatus::Doing));
    assert!(matches!(result, Err(StoreError::Backend(_))));
    assert_eq!(store.status(job.id), Some(JobStatus::Queued));
    assert!(matches!(store.load(99), Err(StoreError::NotFound(99))));
}

#[test]
fn test_transition_clears_schedule() {
    let mut job = Job::new(1, "build", "x").transitioned(JobStatus::SchedLater);
    job.sched_at = Some(chrono::Utc::now());
    assert!(job.transitioned(JobStatus::SchedLater).sched_at.is_some());
    assert!(job.transitioned(JobStatus::Queued).sched_at.is_none());
}

#[test]
fn test_status_display_and_terminal() {
    assert_eq!(JobStatus::SchedLater.to_string(), "sched_later");
    assert_eq!(JobStatus::Doing.to_string(), "doing");
    assert!(JobStatus::Done.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(!JobStatus::SchedLater.is_terminal());
}

#[test]
fn test_dispatch_frame_carries_id_and_payload() {
    let job = Job::new(7, "thumb", "{\"w\":64}");
    let frame = job.pack().unwrap();
    let text = std::str::from_utf8(&frame).unwrap();
    assert!(text.contains("\"id\":7"));
    assert!(text.contains("\"status\":\"queued\""));
    assert_eq!(Job::unpack(&frame).unwrap(), job);
}
