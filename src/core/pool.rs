//! Fixed worker pool, one per queue on the memory backend.
//!
//! Workers are native named threads, each hosting a current-thread tokio
//! runtime for the async executor trait. The queue's blocking container is
//! the sole work source. Shutdown is cooperative: the container is
//! deactivated, every registered in-flight unit is asked to suspend, and the
//! pool joins its threads against the caller's deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::infra::queuing::MemoryWorkQueuing;

use super::container::WorkerScope;
use super::error::WorkError;
use super::executor::{WorkExecutor, WorkOutcome};
use super::transaction::TransactionManager;
use super::work::{WorkContext, WorkState};
use super::wrapper::run_in_transaction;

/// How long an idle worker blocks on the container before re-checking the
/// shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff before re-polling when a pulled unit's id is already running.
const DUPLICATE_BACKOFF: Duration = Duration::from_millis(10);

/// Condvar-based rendezvous for completion waiters.
///
/// Workers signal after every terminal transition; waiters re-check their
/// predicate on each signal and at least every 500 ms, so a missed wakeup
/// only delays the answer.
#[derive(Default)]
pub struct CompletionSynchronizer {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Waiter re-check period.
const WAIT_RECHECK: Duration = Duration::from_millis(500);

impl CompletionSynchronizer {
    /// Create a synchronizer with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake all completion waiters.
    pub fn signal(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `done` returns true or the deadline passes. Returns
    /// whether the predicate was observed true.
    pub fn wait_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let timeout = (deadline - now).min(WAIT_RECHECK);
            self.cond.wait_for(&mut guard, timeout);
        }
    }
}

/// Fixed-size worker pool draining one queue's container.
pub struct WorkerPool {
    queue_id: String,
    queuing: MemoryWorkQueuing,
    shutdown: Arc<AtomicBool>,
    running: Arc<Mutex<HashMap<String, Arc<WorkContext>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct WorkerShared {
    queue_id: String,
    queuing: MemoryWorkQueuing,
    shutdown: Arc<AtomicBool>,
    running: Arc<Mutex<HashMap<String, Arc<WorkContext>>>>,
    executor: Arc<dyn WorkExecutor>,
    tm: Arc<dyn TransactionManager>,
    completion: Arc<CompletionSynchronizer>,
}

impl WorkerPool {
    /// Spawn `threads` workers for a queue and return the running pool.
    pub fn start(
        queue_id: impl Into<String>,
        threads: usize,
        queuing: MemoryWorkQueuing,
        executor: Arc<dyn WorkExecutor>,
        tm: Arc<dyn TransactionManager>,
        completion: Arc<CompletionSynchronizer>,
    ) -> Result<Self, WorkError> {
        let queue_id = queue_id.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = Arc::new(Mutex::new(HashMap::new()));
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let shared = WorkerShared {
                queue_id: queue_id.clone(),
                queuing: queuing.clone(),
                shutdown: Arc::clone(&shutdown),
                running: Arc::clone(&running),
                executor: Arc::clone(&executor),
                tm: Arc::clone(&tm),
                completion: Arc::clone(&completion),
            };
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| WorkError::Backend(format!("worker runtime: {e}")))?;
            let name = format!("workyard-{queue_id}-{n}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(shared, rt))
                .map_err(|e| WorkError::Backend(format!("spawn {name}: {e}")))?;
            workers.push(handle);
        }
        info!(queue = %queue_id, threads, "worker pool started");
        Ok(Self {
            queue_id,
            queuing,
            shutdown,
            running,
            workers: Mutex::new(workers),
        })
    }

    /// Queue this pool drains.
    #[must_use]
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Number of units currently executing on this pool.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Request cooperative cancellation of a running unit. Returns whether
    /// the id was executing here.
    pub fn cancel_running(&self, work_id: &str) -> bool {
        if let Some(ctx) = self.running.lock().get(work_id) {
            ctx.request_cancel();
            return true;
        }
        false
    }

    /// Shut the pool down: pause the container, ask in-flight units to
    /// suspend, join the workers. Returns whether every worker exited before
    /// the deadline.
    pub fn shutdown_and_suspend(&self, deadline: Instant) -> bool {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.queuing.set_active(&self.queue_id, false) {
            error!(queue = %self.queue_id, "pause on shutdown failed: {e}");
        }
        for ctx in self.running.lock().values() {
            ctx.request_suspend();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return true;
        }
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        thread::spawn(move || {
            for handle in handles {
                let _ = handle.join();
            }
            let _ = tx.send(());
        });
        match rx.recv_deadline(deadline) {
            Ok(()) => true,
            Err(_) => {
                warn!(queue = %self.queue_id, "workers did not stop within the timeout");
                false
            }
        }
    }
}

fn worker_loop(shared: WorkerShared, rt: tokio::runtime::Runtime) {
    let _scope = WorkerScope::enter(&shared.queue_id);
    let runtime = match shared.queuing.runtime(&shared.queue_id) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(queue = %shared.queue_id, "worker cannot attach to queue: {e}");
            return;
        }
    };
    while !shared.shutdown.load(Ordering::Acquire) {
        let Some(mut work) = runtime.container.poll(POLL_INTERVAL) else {
            continue;
        };

        // at most one concurrent execution per id: hand duplicates back
        match shared.queuing.is_running(&shared.queue_id, &work.id) {
            Ok(true) => {
                debug!(work_id = %work.id, "id already running, handing back");
                runtime.container.put_unchecked(work);
                thread::sleep(DUPLICATE_BACKOFF);
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                error!(queue = %shared.queue_id, "running check failed: {e}");
                continue;
            }
        }

        work.mark_running();
        if let Err(e) = shared.queuing.work_running(&shared.queue_id, work.clone()) {
            error!(work_id = %work.id, "could not mark running: {e}");
            continue;
        }
        let ctx = Arc::new(WorkContext::new());
        shared
            .running
            .lock()
            .insert(work.id.clone(), Arc::clone(&ctx));
        // a shutdown racing the registration would miss this unit
        if shared.shutdown.load(Ordering::Acquire) {
            ctx.request_suspend();
        }

        let outcome = rt.block_on(run_in_transaction(
            shared.executor.as_ref(),
            shared.tm.as_ref(),
            &work,
            &ctx,
        ));

        shared.running.lock().remove(&work.id);

        let result = match outcome {
            WorkOutcome::Completed => {
                work.mark_finished(WorkState::Completed);
                shared.queuing.work_completed(&shared.queue_id, work)
            }
            WorkOutcome::Failed => {
                work.mark_finished(WorkState::Failed);
                shared.queuing.work_completed(&shared.queue_id, work)
            }
            WorkOutcome::Canceled => {
                work.mark_finished(WorkState::Canceled);
                shared.queuing.work_completed(&shared.queue_id, work)
            }
            // suspended mid-run: back to scheduled for replay after restart
            WorkOutcome::Suspended => shared.queuing.work_reschedule(&shared.queue_id, work),
        };
        if let Err(e) = result {
            error!(queue = %shared.queue_id, "terminal transition failed: {e}");
        }
        shared.completion.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkQueueDescriptor;
    use crate::core::executor::ExecError;
    use crate::core::transaction::LocalTransactionManager;
    use crate::core::work::Work;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        executed: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl WorkExecutor for CountingExecutor {
        async fn execute(&self, _work: &Work, ctx: &WorkContext) -> Result<(), ExecError> {
            let deadline = Instant::now() + self.delay;
            while Instant::now() < deadline {
                if ctx.is_suspending() {
                    ctx.suspended();
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(
        threads: usize,
        delay: Duration,
    ) -> (
        MemoryWorkQueuing,
        Arc<CountingExecutor>,
        Arc<CompletionSynchronizer>,
        WorkerPool,
    ) {
        let queuing = MemoryWorkQueuing::new();
        queuing
            .init_queue(&WorkQueueDescriptor::new("q"))
            .unwrap();
        let executor = Arc::new(CountingExecutor {
            executed: AtomicUsize::new(0),
            delay,
        });
        let completion = Arc::new(CompletionSynchronizer::new());
        let pool = WorkerPool::start(
            "q",
            threads,
            queuing.clone(),
            Arc::clone(&executor) as Arc<dyn WorkExecutor>,
            Arc::new(LocalTransactionManager),
            Arc::clone(&completion),
        )
        .unwrap();
        (queuing, executor, completion, pool)
    }

    fn quiescent(queuing: &MemoryWorkQueuing) -> bool {
        let m = queuing.metrics("q").unwrap();
        m.scheduled == 0 && m.running == 0
    }

    #[test]
    fn test_pool_drains_queue() {
        let (queuing, executor, completion, pool) = setup(2, Duration::ZERO);
        for i in 0..10 {
            let mut w = Work::with_id(format!("w{i}"), "cat", serde_json::Value::Null);
            w.mark_scheduled();
            queuing.work_schedule("q", w).unwrap();
        }
        assert!(completion.wait_until(Instant::now() + Duration::from_secs(5), || {
            quiescent(&queuing)
        }));
        assert_eq!(executor.executed.load(Ordering::SeqCst), 10);
        assert_eq!(queuing.metrics("q").unwrap().completed, 10);
        assert!(pool.shutdown_and_suspend(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_replays_in_flight_work() {
        let (queuing, executor, completion, pool) = setup(1, Duration::from_secs(30));
        let mut w = Work::with_id("slow", "cat", serde_json::Value::Null);
        w.mark_scheduled();
        queuing.work_schedule("q", w).unwrap();

        // wait for the unit to actually start
        assert!(completion.wait_until(Instant::now() + Duration::from_secs(5), || {
            pool.running_count() == 1
        }));

        assert!(pool.shutdown_and_suspend(Instant::now() + Duration::from_secs(5)));
        assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
        assert_eq!(
            queuing.work_state("slow"),
            Some(WorkState::Scheduled),
            "suspended unit goes back to scheduled for replay"
        );
    }

    #[test]
    fn test_cancel_running_unit() {
        struct CancelAware;

        #[async_trait]
        impl WorkExecutor for CancelAware {
            async fn execute(&self, _work: &Work, ctx: &WorkContext) -> Result<(), ExecError> {
                loop {
                    if ctx.is_cancel_requested() {
                        return Err(ExecError::Canceled);
                    }
                    if ctx.is_suspending() {
                        ctx.suspended();
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }

        let queuing = MemoryWorkQueuing::new();
        queuing
            .init_queue(&WorkQueueDescriptor::new("q"))
            .unwrap();
        let completion = Arc::new(CompletionSynchronizer::new());
        let pool = WorkerPool::start(
            "q",
            1,
            queuing.clone(),
            Arc::new(CancelAware),
            Arc::new(LocalTransactionManager),
            Arc::clone(&completion),
        )
        .unwrap();

        let mut w = Work::with_id("w1", "cat", serde_json::Value::Null);
        w.mark_scheduled();
        queuing.work_schedule("q", w).unwrap();
        assert!(completion.wait_until(Instant::now() + Duration::from_secs(5), || {
            pool.running_count() == 1
        }));
        assert!(pool.cancel_running("w1"));
        assert!(completion.wait_until(Instant::now() + Duration::from_secs(5), || {
            queuing.work_state("w1") == Some(WorkState::Canceled)
        }));
        let metrics = queuing.metrics("q").unwrap();
        assert_eq!(metrics.canceled, 1, "a canceled run counts as canceled");
        assert_eq!(metrics.completed, 0);
        assert!(pool.shutdown_and_suspend(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_completion_synchronizer_times_out() {
        let sync = CompletionSynchronizer::new();
        let start = Instant::now();
        assert!(!sync.wait_until(Instant::now() + Duration::from_millis(50), || false));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
