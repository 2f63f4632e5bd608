//! End-to-end tests of the work manager on the memory backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use workyard::builders::WorkManagerBuilder;
use workyard::config::{WorkManagerConfig, WorkQueueDescriptor};
use workyard::core::{
    ExecError, SchedulePolicy, Work, WorkContext, WorkError, WorkExecutor, WorkManager, WorkState,
};

/// Records executions and catches concurrent executions of the same id.
struct RecordingExecutor {
    executed: AtomicUsize,
    active_ids: Mutex<HashSet<String>>,
    overlap_seen: AtomicBool,
    delay: Duration,
}

impl RecordingExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            executed: AtomicUsize::new(0),
            active_ids: Mutex::new(HashSet::new()),
            overlap_seen: AtomicBool::new(false),
            delay,
        }
    }
}

#[async_trait]
impl WorkExecutor for RecordingExecutor {
    async fn execute(&self, work: &Work, ctx: &WorkContext) -> Result<(), ExecError> {
        if !self.active_ids.lock().insert(work.id.clone()) {
            self.overlap_seen.store(true, Ordering::SeqCst);
        }
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if ctx.is_cancel_requested() {
                self.active_ids.lock().remove(&work.id);
                return Err(ExecError::Canceled);
            }
            if ctx.is_suspending() {
                self.active_ids.lock().remove(&work.id);
                ctx.suspended();
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.active_ids.lock().remove(&work.id);
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn build_manager(
    config: WorkManagerConfig,
    executor: Arc<RecordingExecutor>,
) -> WorkManager {
    workyard::util::init_tracing();
    WorkManagerBuilder::new()
        .config(config)
        .executor(executor)
        .build()
        .expect("manager builds")
}

fn work(id: &str, category: &str) -> Work {
    Work::with_id(id, category, serde_json::Value::Null)
}

#[test]
fn test_end_to_end_default_queue() {
    // single worker, capacity 1: B queues behind A (200 ms) and both finish
    let mut config = WorkManagerConfig::default();
    config.queues.push(
        WorkQueueDescriptor::new("default")
            .with_capacity(1)
            .with_max_threads(1),
    );
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(200)));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    assert!(manager
        .schedule(work("w1", "anything"), SchedulePolicy::Enqueue)
        .unwrap());
    assert!(manager
        .schedule(work("w2", "anything"), SchedulePolicy::Enqueue)
        .unwrap());

    assert!(manager.await_completion(Some("default"), Duration::from_secs(5)).unwrap());
    let metrics = manager.metrics("default").unwrap();
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.scheduled, 0);
    assert_eq!(metrics.running, 0);
    assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_await_completion_rejects_unknown_queue() {
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(WorkManagerConfig::default(), Arc::clone(&executor));
    manager.start().unwrap();

    // a typoed queue id must surface as an error, not as "all work done"
    assert!(matches!(
        manager.await_completion(Some("no-such-queue"), Duration::from_millis(10)),
        Err(WorkError::UnknownQueue(_))
    ));
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_at_most_one_concurrent_execution_per_id() {
    let mut config = WorkManagerConfig::default();
    config.queues.push(
        WorkQueueDescriptor::new("busy")
            .with_categories(["busy"])
            .with_max_threads(4),
    );
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(100)));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    // the same id resubmitted while running must wait for the first run
    manager
        .schedule(work("dup", "busy"), SchedulePolicy::Enqueue)
        .unwrap();
    thread::sleep(Duration::from_millis(30));
    manager
        .schedule(work("dup", "busy"), SchedulePolicy::Enqueue)
        .unwrap();

    assert!(manager.await_completion(Some("busy"), Duration::from_secs(10)).unwrap());
    assert!(!executor.overlap_seen.load(Ordering::SeqCst));
    assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_capacity_blocks_submitter_until_slot_frees() {
    let mut config = WorkManagerConfig::default();
    let mut q = WorkQueueDescriptor::new("tight")
        .with_categories(["tight"])
        .with_capacity(1)
        .with_max_threads(1);
    q.processing_enabled = false;
    config.queues.push(q);
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    manager
        .schedule(work("w1", "tight"), SchedulePolicy::Enqueue)
        .unwrap();

    let second_done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&second_done);
    let m = manager.clone();
    let submitter = thread::spawn(move || {
        m.schedule(work("w2", "tight"), SchedulePolicy::Enqueue)
            .unwrap();
        flag.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(100));
    assert!(
        !second_done.load(Ordering::SeqCst),
        "submitter must block while the queue is at capacity"
    );

    manager.enable_processing("tight", true).unwrap();
    submitter.join().unwrap();
    assert!(manager.await_completion(Some("tight"), Duration::from_secs(10)).unwrap());
    assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_scheduling_policies() {
    let mut config = WorkManagerConfig::default();
    let mut q = WorkQueueDescriptor::new("held").with_categories(["held"]);
    q.processing_enabled = false;
    config.queues.push(q);
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    assert!(manager
        .schedule(work("a", "held"), SchedulePolicy::Enqueue)
        .unwrap());
    // already scheduled: both dedupe policies skip
    assert!(!manager
        .schedule(work("a", "held"), SchedulePolicy::IfNotScheduled)
        .unwrap());
    assert!(!manager
        .schedule(work("a", "held"), SchedulePolicy::IfNotRunningOrScheduled)
        .unwrap());
    assert_eq!(manager.queue_size("held", Some(WorkState::Scheduled)).unwrap(), 1);

    // CancelScheduled replaces the pending instance
    assert!(manager
        .schedule(work("a", "held"), SchedulePolicy::CancelScheduled)
        .unwrap());
    let metrics = manager.metrics("held").unwrap();
    assert_eq!(metrics.scheduled, 1);
    assert_eq!(metrics.canceled, 1);

    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_if_not_running_policy_skips_while_running() {
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(300)));
    let manager = build_manager(WorkManagerConfig::default(), Arc::clone(&executor));
    manager.start().unwrap();

    manager
        .schedule(work("r1", "cat"), SchedulePolicy::Enqueue)
        .unwrap();
    // wait for the unit to start
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.work_state("r1") != Some(WorkState::Running) {
        assert!(Instant::now() < deadline, "work never started");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(!manager
        .schedule(work("r1", "cat"), SchedulePolicy::IfNotRunningOrScheduled)
        .unwrap());
    // IfNotScheduled only checks the scheduled state, so it goes through
    assert!(manager
        .schedule(work("r1", "cat"), SchedulePolicy::IfNotScheduled)
        .unwrap());

    assert!(manager.await_completion(None, Duration::from_secs(10)).unwrap());
    assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_cancel_scheduled_is_idempotent() {
    let mut config = WorkManagerConfig::default();
    let mut q = WorkQueueDescriptor::new("held").with_categories(["held"]);
    q.processing_enabled = false;
    config.queues.push(q);
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    manager
        .schedule(work("c1", "held"), SchedulePolicy::Enqueue)
        .unwrap();
    assert_eq!(manager.work_state("c1"), Some(WorkState::Scheduled));
    assert!(manager.cancel_scheduled("c1").unwrap());
    assert!(!manager.cancel_scheduled("c1").unwrap());
    assert!(!manager.cancel_scheduled("never-submitted").unwrap());
    assert_eq!(manager.work_state("c1"), None);

    manager.enable_processing("held", true).unwrap();
    assert!(manager.await_completion(Some("held"), Duration::from_secs(10)).unwrap());
    assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_suspends_and_replays_in_flight_work() {
    let executor = Arc::new(RecordingExecutor::new(Duration::from_secs(60)));
    let manager = build_manager(WorkManagerConfig::default(), Arc::clone(&executor));
    manager.start().unwrap();

    manager
        .schedule(work("slow", "cat"), SchedulePolicy::Enqueue)
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.work_state("slow") != Some(WorkState::Running) {
        assert!(Instant::now() < deadline, "work never started");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(manager.shutdown(Duration::from_secs(10)));
    assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
    assert_eq!(
        manager.work_state("slow"),
        Some(WorkState::Scheduled),
        "in-flight unit must be re-marked scheduled for replay"
    );
}

#[test]
fn test_shutdown_with_too_short_timeout_reports_false() {
    let mut config = WorkManagerConfig::default();
    config.queues.push(
        WorkQueueDescriptor::new("default").with_max_threads(2),
    );
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(500)));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    for i in 0..10 {
        manager
            .schedule(work(&format!("w{i}"), "cat"), SchedulePolicy::Enqueue)
            .unwrap();
    }
    // let the two workers pick something up
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.metrics("default").unwrap().running < 2 {
        assert!(Instant::now() < deadline, "workers never started");
        thread::sleep(Duration::from_millis(5));
    }

    // workers cannot acknowledge within 1 ms
    assert!(!manager.shutdown(Duration::from_millis(1)));

    // the suspend requests land anyway; in-flight units return to scheduled
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.metrics("default").unwrap().running > 0 {
        assert!(Instant::now() < deadline, "in-flight units never suspended");
        thread::sleep(Duration::from_millis(10));
    }
    let metrics = manager.metrics("default").unwrap();
    assert_eq!(metrics.completed, 0, "nothing may be marked completed");
    assert_eq!(metrics.scheduled, 10, "every unit must remain replayable");
}

#[test]
fn test_introspection_and_history_pruning() {
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(WorkManagerConfig::default(), Arc::clone(&executor));
    manager.start().unwrap();

    for i in 0..3 {
        manager
            .schedule(work(&format!("w{i}"), "cat"), SchedulePolicy::Enqueue)
            .unwrap();
    }
    assert!(manager.await_completion(None, Duration::from_secs(10)).unwrap());

    let completed = manager
        .list_work("default", Some(WorkState::Completed))
        .unwrap();
    assert_eq!(completed.len(), 3);
    let mut ids = manager
        .list_work_ids("default", Some(WorkState::Completed))
        .unwrap();
    ids.sort();
    assert_eq!(ids, vec!["w0", "w1", "w2"]);
    assert!(manager.find("w0", Some(WorkState::Completed)).is_some());
    assert_eq!(manager.queue_size("default", None).unwrap(), 0);

    let now_plus = workyard::util::now_ms() + 1_000;
    assert_eq!(manager.clear_completed_before("default", now_plus).unwrap(), 3);
    assert!(manager.find("w0", Some(WorkState::Completed)).is_none());
    // counters are cumulative and survive pruning
    assert_eq!(manager.metrics("default").unwrap().completed, 3);

    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_enable_processing_all() {
    let mut config = WorkManagerConfig::default();
    config
        .queues
        .push(WorkQueueDescriptor::new("a").with_categories(["a"]));
    config
        .queues
        .push(WorkQueueDescriptor::new("b").with_categories(["b"]));
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    manager.enable_processing_all(false).unwrap();
    assert!(!manager.is_processing_enabled("a").unwrap());
    assert!(!manager.is_processing_enabled("b").unwrap());

    manager
        .schedule(work("w1", "a"), SchedulePolicy::Enqueue)
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.work_state("w1"), Some(WorkState::Scheduled));

    manager.enable_processing_all(true).unwrap();
    assert!(manager.await_completion(None, Duration::from_secs(10)).unwrap());
    assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    assert!(manager.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_queue_leaves_others_running() {
    let mut config = WorkManagerConfig::default();
    config
        .queues
        .push(WorkQueueDescriptor::new("doomed").with_categories(["doomed"]));
    let executor = Arc::new(RecordingExecutor::new(Duration::ZERO));
    let manager = build_manager(config, Arc::clone(&executor));
    manager.start().unwrap();

    assert!(manager
        .shutdown_queue("doomed", Duration::from_secs(5))
        .unwrap());

    // the default queue still processes
    manager
        .schedule(work("w1", "other"), SchedulePolicy::Enqueue)
        .unwrap();
    assert!(manager.await_completion(Some("default"), Duration::from_secs(10)).unwrap());
    assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    assert!(manager.shutdown(Duration::from_secs(5)));
}
