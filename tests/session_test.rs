//! Drone 会话协议测试
//!
//! 覆盖：
//! 1. grab/done/fail/sched_later 的任务生命周期
//! 2. 断开连接后的任务回收
//! 3. ping/sleep/未知命令与格式错误的帧

use std::sync::Arc;
use std::time::Duration;

use hive_sched::{BrokerConfig, Command, Job, JobStatus, JobStore, MemoryStore, Queen, Reply};

use test_utils::{connect, init_logger, settle, test_config, wait_status, wait_until};

fn start(config: BrokerConfig) -> (Arc<MemoryStore>, Queen) {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let queen = Queen::start(store.clone(), config).expect("queen start");
    (store, queen)
}

fn submit(store: &MemoryStore, queen: &Queen, id: i64, function: &str) {
    let job = Job::new(id, function, format!("payload-{}", id));
    store.save(&job).unwrap();
    queen.submit(job).unwrap();
}

#[test]
fn test_grab_dispatches_job() {
    let (store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);

    peer.send_raw(b"can_do\0build");
    peer.send_raw(b"grab");
    assert_eq!(peer.recv(), Reply::NoJob);

    submit(&store, &queen, 42, "build");
    let job = peer.recv_job();
    assert_eq!(job.id, 42);
    assert_eq!(job.function, "build");
    assert_eq!(job.payload, "payload-42");
    wait_status(&store, 42, JobStatus::Doing);

    queen.shutdown();
}

#[test]
fn test_done_finishes_job() {
    let (store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);
    submit(&store, &queen, 42, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 42);
    wait_status(&store, 42, JobStatus::Doing);

    peer.send_raw(b"done\x0042");
    wait_status(&store, 42, JobStatus::Done);
    wait_until("job to leave the registry", || queen.stats().unwrap().doing == 0);

    // 已完成的任务不再属于该会话，重复上报被忽略
    peer.send_raw(b"done\x0042");
    peer.send(Command::Ping);
    assert_eq!(peer.recv(), Reply::Pong);
    assert_eq!(store.status(42), Some(JobStatus::Done));

    queen.shutdown();
}

#[test]
fn test_fail_is_terminal() {
    let (store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);
    submit(&store, &queen, 9, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 9);
    peer.send(Command::Fail(9));
    wait_status(&store, 9, JobStatus::Failed);

    peer.send(Command::Grab);
    peer.assert_no_job(Duration::from_millis(100));
    assert_eq!(queen.stats().unwrap().queued, 0);

    queen.shutdown();
}

#[test]
fn test_sched_later_requeues_after_delay() {
    let config = BrokerConfig {
        delay_unit_ms: 10,
        ..BrokerConfig::default()
    };
    let (store, queen) = start(config);
    let (peer, _session) = connect(&queen);
    submit(&store, &queen, 42, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 42);
    wait_status(&store, 42, JobStatus::Doing);

    peer.send_raw(b"sched_later\x0042\x0030");
    wait_status(&store, 42, JobStatus::SchedLater);
    assert!(store.load(42).unwrap().sched_at.is_some());

    wait_status(&store, 42, JobStatus::Queued);
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 42);
    wait_status(&store, 42, JobStatus::Doing);

    queen.shutdown();
}

#[test]
fn test_disconnect_requeues_inflight_jobs() {
    let (store, queen) = start(test_config());
    let (mut peer, session) = connect(&queen);
    submit(&store, &queen, 7, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 7);
    wait_status(&store, 7, JobStatus::Doing);

    peer.hang_up();
    session.join().unwrap();
    wait_status(&store, 7, JobStatus::Queued);
    wait_until("session cleanup", || {
        let stats = queen.stats().unwrap();
        stats.sessions == 0 && stats.grab_queue == 0 && stats.functions == 0
    });

    let (other, _other_session) = connect(&queen);
    other.send(Command::CanDo("build".into()));
    other.send(Command::Grab);
    assert_eq!(other.recv_job().id, 7);

    queen.shutdown();
}

#[test]
fn test_disconnect_with_fail_policy() {
    let config = BrokerConfig {
        disconnect_policy: hive_sched::DisconnectPolicy::Fail,
        ..test_config()
    };
    let (store, queen) = start(config);
    let (mut peer, session) = connect(&queen);
    submit(&store, &queen, 7, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 7);

    peer.hang_up();
    session.join().unwrap();
    wait_status(&store, 7, JobStatus::Failed);

    queen.shutdown();
}

#[test]
fn test_fail_policy_retries_failed_save() {
    let config = BrokerConfig {
        disconnect_policy: hive_sched::DisconnectPolicy::Fail,
        ..test_config()
    };
    let (store, queen) = start(config);
    let (mut peer, session) = connect(&queen);
    submit(&store, &queen, 8, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 8);
    wait_status(&store, 8, JobStatus::Doing);

    // 写入 failed 失败，重试时仍然写 failed
    store.set_fail_saves(true);
    peer.hang_up();
    session.join().unwrap();
    settle(&queen);
    store.set_fail_saves(false);

    wait_until("job 8 to become failed", || {
        let status = store.status(8);
        assert_ne!(status, Some(JobStatus::Queued));
        status == Some(JobStatus::Failed)
    });
    settle(&queen);
    let stats = queen.stats().unwrap();
    assert_eq!((stats.queued, stats.doing, stats.scheduled), (0, 0, 0));

    queen.shutdown();
}

#[test]
fn test_ping_sleep_and_unknown() {
    let (_store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);

    peer.send_raw(b"ping");
    assert_eq!(peer.recv(), Reply::Pong);
    peer.send_raw(b"foobar");
    assert_eq!(peer.recv(), Reply::Unknown);
    peer.send_raw(b"sleep");
    assert_eq!(peer.recv(), Reply::Nop);
    // 空帧是名字为空的未知命令
    peer.send_raw(b"");
    assert_eq!(peer.recv(), Reply::Unknown);
    peer.send_raw(b"ping");
    assert_eq!(peer.recv(), Reply::Pong);

    queen.shutdown();
}

#[test]
fn test_malformed_frames_are_ignored() {
    let (_store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);

    peer.send_raw(b"done");
    peer.send_raw(b"fail\0abc");
    peer.send_raw(b"sched_later\x0042");
    peer.send_raw(b"can_do");
    peer.send(Command::Ping);
    // 格式错误的帧没有回复，第一条回复就是 pong
    assert_eq!(peer.recv(), Reply::Pong);

    queen.shutdown();
}

#[test]
fn test_capability_idempotence() {
    let (store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::CanDo("build".into()));
    settle(&queen);
    assert_eq!(queen.stats().unwrap().functions, 1);

    peer.send(Command::CanNoDo("build".into()));
    peer.send(Command::CanNoDo("build".into()));
    settle(&queen);
    assert_eq!(queen.stats().unwrap().functions, 0);

    // 撤销后不再收到该 function 的任务
    peer.send(Command::Grab);
    assert_eq!(peer.recv(), Reply::NoJob);
    submit(&store, &queen, 1, "build");
    peer.assert_no_job(Duration::from_millis(100));
    assert_eq!(store.status(1), Some(JobStatus::Queued));

    queen.shutdown();
}

#[test]
fn test_store_failure_keeps_job_owned() {
    let (store, queen) = start(test_config());
    let (peer, _session) = connect(&queen);
    submit(&store, &queen, 5, "build");

    peer.send(Command::CanDo("build".into()));
    peer.send(Command::Grab);
    assert_eq!(peer.recv_job().id, 5);
    wait_status(&store, 5, JobStatus::Doing);

    store.set_fail_saves(true);
    peer.send(Command::Done(5));
    settle(&queen);
    assert_eq!(store.status(5), Some(JobStatus::Doing));
    assert_eq!(queen.stats().unwrap().doing, 1);

    // 会话仍然持有任务，可以再次上报
    store.set_fail_saves(false);
    peer.send(Command::Done(5));
    wait_status(&store, 5, JobStatus::Done);

    queen.shutdown();
}

#[test]
fn test_failed_dispatch_goes_to_next_drone() {
    let (store, queen) = start(test_config());
    let (first, first_session) = connect(&queen);
    first.send(Command::CanDo("build".into()));
    first.send(Command::Grab);
    assert_eq!(first.recv(), Reply::NoJob);

    let (second, _second_session) = connect(&queen);
    second.send(Command::CanDo("build".into()));
    second.send(Command::Grab);
    assert_eq!(second.recv(), Reply::NoJob);

    first.break_sends();
    submit(&store, &queen, 3, "build");

    assert_eq!(second.recv_job().id, 3);
    wait_status(&store, 3, JobStatus::Doing);
    first_session.join().unwrap();
    wait_until("broken session removal", || queen.stats().unwrap().sessions == 1);

    queen.shutdown();
}
