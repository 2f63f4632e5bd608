//! Work manager: the coordinator owning routing, backends, and pools.
//!
//! Explicitly constructed (no global registry): the embedding application
//! builds one from a configuration, an executor, and a transaction manager,
//! and passes it around. Clones share the same engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{QueuingBackendKind, WorkManagerConfig, DEFAULT_QUEUE_ID};
use crate::infra::queuing::{MemoryWorkQueuing, StreamWorkQueuing};

use super::error::WorkError;
use super::executor::WorkExecutor;
use super::metrics::QueueMetrics;
use super::pool::{CompletionSynchronizer, WorkerPool};
use super::transaction::{Transaction, TransactionManager, TxStatus};
use super::work::{Work, WorkState};

/// Re-check period when waiting on stream lag.
const LAG_POLL: Duration = Duration::from_millis(100);

/// What to do when a unit with the same id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulePolicy {
    /// Always enqueue, regardless of duplicates.
    #[default]
    Enqueue,
    /// Remove a scheduled unit with the same id first, then enqueue.
    CancelScheduled,
    /// Skip silently when the id is already scheduled.
    IfNotScheduled,
    /// Skip silently when the id is already scheduled or running.
    IfNotRunningOrScheduled,
}

/// Manager lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Started,
    ShuttingDown,
    Stopped,
}

enum Backend {
    Memory {
        queuing: MemoryWorkQueuing,
        pools: Mutex<HashMap<String, WorkerPool>>,
    },
    Stream(StreamWorkQueuing),
}

struct Inner {
    config: WorkManagerConfig,
    routing: HashMap<String, String>,
    backend: Backend,
    executor: Arc<dyn WorkExecutor>,
    tm: Arc<dyn TransactionManager>,
    completion: Arc<CompletionSynchronizer>,
    phase: Mutex<Phase>,
}

/// Handle to the scheduling engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkManager {
    inner: Arc<Inner>,
}

impl WorkManager {
    /// Build a manager from a validated configuration. Queues are
    /// initialized immediately; workers start on [`WorkManager::start`].
    pub fn new(
        mut config: WorkManagerConfig,
        executor: Arc<dyn WorkExecutor>,
        tm: Arc<dyn TransactionManager>,
    ) -> Result<Self, WorkError> {
        config.validate()?;
        config.ensure_default_queue();
        let routing = config.category_routing();
        let backend = match config.backend {
            QueuingBackendKind::Memory => {
                let queuing = MemoryWorkQueuing::new();
                for descriptor in &config.queues {
                    queuing.init_queue(descriptor)?;
                    if !descriptor.processing_enabled {
                        queuing.set_active(&descriptor.id, false)?;
                    }
                }
                Backend::Memory {
                    queuing,
                    pools: Mutex::new(HashMap::new()),
                }
            }
            QueuingBackendKind::Stream => {
                let queuing = StreamWorkQueuing::new(config.stream.clone());
                for descriptor in &config.queues {
                    queuing.init_queue(descriptor)?;
                }
                Backend::Stream(queuing)
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                routing,
                backend,
                executor,
                tm,
                completion: Arc::new(CompletionSynchronizer::new()),
                phase: Mutex::new(Phase::Unstarted),
            }),
        })
    }

    /// Queue a category routes to; unmapped categories use the default queue.
    #[must_use]
    pub fn queue_for(&self, category: &str) -> &str {
        self.inner
            .routing
            .get(category)
            .map(String::as_str)
            .unwrap_or(DEFAULT_QUEUE_ID)
    }

    /// Start processing: spawn the worker pools (memory) or the stream
    /// computation workers. Idempotent while started.
    pub fn start(&self) -> Result<(), WorkError> {
        let mut phase = self.inner.phase.lock();
        match *phase {
            Phase::Started => return Ok(()),
            Phase::Unstarted => {}
            Phase::ShuttingDown | Phase::Stopped => {
                return Err(WorkError::InvalidConfig(
                    "manager cannot restart after shutdown".into(),
                ));
            }
        }
        match &self.inner.backend {
            Backend::Memory { queuing, pools } => {
                let mut pools = pools.lock();
                for descriptor in &self.inner.config.queues {
                    let pool = WorkerPool::start(
                        descriptor.id.clone(),
                        descriptor.max_threads,
                        queuing.clone(),
                        Arc::clone(&self.inner.executor),
                        Arc::clone(&self.inner.tm),
                        Arc::clone(&self.inner.completion),
                    )?;
                    pools.insert(descriptor.id.clone(), pool);
                }
            }
            Backend::Stream(queuing) => {
                queuing.start(Arc::clone(&self.inner.executor), Arc::clone(&self.inner.tm))?;
            }
        }
        *phase = Phase::Started;
        info!(
            queues = self.inner.config.queues.len(),
            "work manager started"
        );
        Ok(())
    }

    /// Whether the manager is started and not shutting down.
    #[must_use]
    pub fn is_started(&self) -> bool {
        *self.inner.phase.lock() == Phase::Started
    }

    fn ensure_accepting(&self) -> Result<(), WorkError> {
        // scheduling stays accepted while shutting down; late units are
        // picked up after a restart (stream) or dropped with the process
        match *self.inner.phase.lock() {
            Phase::Started | Phase::ShuttingDown => Ok(()),
            Phase::Unstarted | Phase::Stopped => Err(WorkError::NotStarted),
        }
    }

    /// Submit a unit under a scheduling policy. `Ok(false)` means the policy
    /// (or a disabled queue) skipped it silently; `Err` means
    /// misconfiguration.
    pub fn schedule(&self, work: Work, policy: SchedulePolicy) -> Result<bool, WorkError> {
        self.ensure_accepting()?;
        let queue_id = self.queue_for(&work.category).to_string();
        let descriptor = self
            .inner
            .config
            .queue(&queue_id)
            .ok_or_else(|| WorkError::UnknownQueue(queue_id.clone()))?;
        if !descriptor.queuing_enabled {
            debug!(queue = %queue_id, work_id = %work.id, "queuing disabled, dropping");
            return Ok(false);
        }

        match policy {
            SchedulePolicy::Enqueue => {}
            SchedulePolicy::CancelScheduled => {
                self.cancel_scheduled_in(&queue_id, &work.id)?;
            }
            SchedulePolicy::IfNotScheduled => {
                if self.work_state(&work.id) == Some(WorkState::Scheduled) {
                    debug!(work_id = %work.id, "already scheduled, policy skip");
                    return Ok(false);
                }
            }
            SchedulePolicy::IfNotRunningOrScheduled => {
                if matches!(
                    self.work_state(&work.id),
                    Some(WorkState::Scheduled | WorkState::Running)
                ) {
                    debug!(work_id = %work.id, "already scheduled or running, policy skip");
                    return Ok(false);
                }
            }
        }

        match &self.inner.backend {
            Backend::Memory { queuing, .. } => {
                let mut work = work;
                work.mark_scheduled();
                Ok(queuing.work_schedule(&queue_id, work)?.is_some())
            }
            Backend::Stream(queuing) => queuing.work_schedule(&queue_id, work),
        }
    }

    /// Remove a unit that is still scheduled. Idempotent: a missing or
    /// already-running id is `Ok(false)`.
    pub fn cancel_scheduled(&self, work_id: &str) -> Result<bool, WorkError> {
        for queue_id in self.queue_ids() {
            if self.cancel_scheduled_in(&queue_id, work_id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn cancel_scheduled_in(&self, queue_id: &str, work_id: &str) -> Result<bool, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.cancel_scheduled(queue_id, work_id),
            Backend::Stream(queuing) => queuing.cancel_scheduled(queue_id, work_id),
        }
    }

    /// Register a unit for submission when `txn` commits. An already
    /// committed (or absent) transaction schedules immediately; a
    /// rolled-back one suppresses the submission and returns `Ok(false)`.
    pub fn schedule_after_commit(
        &self,
        work: Work,
        policy: SchedulePolicy,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<bool, WorkError> {
        self.ensure_accepting()?;
        let Some(txn) = txn else {
            return self.schedule(work, policy);
        };
        match txn.status() {
            TxStatus::Committed => self.schedule(work, policy),
            TxStatus::Active => {
                let manager = self.clone();
                let work_id = work.id.clone();
                let registered = txn.on_commit(move || {
                    let id = work.id.clone();
                    if let Err(e) = manager.schedule(work, policy) {
                        error!(work_id = %id, "after-commit scheduling failed: {e}");
                    }
                });
                if !registered {
                    // the transaction closed between the status read and the
                    // registration; treat as rolled back
                    debug!(work_id = %work_id, "transaction closed, submission suppressed");
                    return Ok(false);
                }
                Ok(true)
            }
            TxStatus::MarkedRollback | TxStatus::RolledBack => {
                debug!(work_id = %work.id, "transaction rolled back, submission suppressed");
                Ok(false)
            }
        }
    }

    fn quiescent(&self, queue: Option<&str>) -> bool {
        let queue_ids = match queue {
            Some(q) => vec![q.to_string()],
            None => self.queue_ids(),
        };
        queue_ids.iter().all(|q| match self.metrics(q) {
            Ok(m) => m.scheduled == 0 && m.running == 0,
            Err(_) => false,
        })
    }

    /// Block until the queue (or all queues) hold no scheduled or running
    /// work, or the timeout passes. An unknown queue id is an error, never a
    /// satisfied wait. Not obliged to return `true` while a shutdown is in
    /// progress.
    pub fn await_completion(
        &self,
        queue: Option<&str>,
        timeout: Duration,
    ) -> Result<bool, WorkError> {
        if let Some(q) = queue {
            self.metrics(q)?;
        }
        let deadline = Instant::now() + timeout;
        match &self.inner.backend {
            Backend::Memory { .. } => Ok(self
                .inner
                .completion
                .wait_until(deadline, || self.quiescent(queue))),
            Backend::Stream(queuing) => loop {
                let done = match queue {
                    Some(q) => queuing.lag(q)? == 0,
                    None => queuing.total_lag() == 0,
                };
                if done {
                    return Ok(true);
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(LAG_POLL);
            },
        }
    }

    /// Pause or resume processing of one queue. Scheduling stays accepted
    /// either way.
    pub fn enable_processing(&self, queue_id: &str, enabled: bool) -> Result<(), WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.set_active(queue_id, enabled),
            Backend::Stream(queuing) => queuing.set_active(queue_id, enabled),
        }
    }

    /// Apply a processing toggle to every queue.
    pub fn enable_processing_all(&self, enabled: bool) -> Result<(), WorkError> {
        for queue_id in self.queue_ids() {
            self.enable_processing(&queue_id, enabled)?;
        }
        Ok(())
    }

    /// Whether a queue's workers currently consume.
    pub fn is_processing_enabled(&self, queue_id: &str) -> Result<bool, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.is_active(queue_id),
            Backend::Stream(queuing) => queuing.is_active(queue_id),
        }
    }

    /// Shut the whole engine down: every pool runs the suspend protocol
    /// against one shared deadline. Returns whether everything stopped in
    /// time. Infrastructure trouble during shutdown is reported as `false`,
    /// never as a panic or error.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Stopped => return true,
                Phase::Unstarted => {
                    *phase = Phase::Stopped;
                    return true;
                }
                _ => *phase = Phase::ShuttingDown,
            }
        }
        let deadline = Instant::now() + timeout;
        let clean = match &self.inner.backend {
            Backend::Memory { pools, .. } => {
                let pools: Vec<WorkerPool> = {
                    let mut map = pools.lock();
                    map.drain().map(|(_, pool)| pool).collect()
                };
                let mut clean = true;
                for pool in &pools {
                    clean &= pool.shutdown_and_suspend(deadline);
                }
                clean
            }
            Backend::Stream(queuing) => queuing.shutdown(timeout),
        };
        *self.inner.phase.lock() = Phase::Stopped;
        if clean {
            info!("work manager stopped");
        } else {
            warn!("work manager stopped with workers still alive");
        }
        clean
    }

    /// Shut one queue down, leaving the rest of the engine running. On the
    /// stream backend queue workers are shared infrastructure, so this only
    /// pauses consumption.
    pub fn shutdown_queue(&self, queue_id: &str, timeout: Duration) -> Result<bool, WorkError> {
        match &self.inner.backend {
            Backend::Memory { pools, .. } => {
                let Some(pool) = pools.lock().remove(queue_id) else {
                    return Err(WorkError::UnknownQueue(queue_id.to_string()));
                };
                Ok(pool.shutdown_and_suspend(Instant::now() + timeout))
            }
            Backend::Stream(queuing) => {
                queuing.set_active(queue_id, false)?;
                Ok(true)
            }
        }
    }

    /// Ids of all configured queues.
    #[must_use]
    pub fn queue_ids(&self) -> Vec<String> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.queue_ids(),
            Backend::Stream(queuing) => queuing.queue_ids(),
        }
    }

    /// Metrics snapshot for a queue. Approximate on the stream backend.
    pub fn metrics(&self, queue_id: &str) -> Result<QueueMetrics, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.metrics(queue_id),
            Backend::Stream(queuing) => queuing.metrics(queue_id),
        }
    }

    /// Number of units a queue holds in a given state (`None` = scheduled
    /// plus running). Unknown and Failed are not tracked separately and
    /// count zero.
    pub fn queue_size(
        &self,
        queue_id: &str,
        state: Option<WorkState>,
    ) -> Result<u64, WorkError> {
        let m = self.metrics(queue_id)?;
        Ok(match state {
            None => m.scheduled + m.running,
            Some(WorkState::Scheduled) => m.scheduled,
            Some(WorkState::Running) => m.running,
            Some(WorkState::Completed) => m.completed,
            Some(WorkState::Canceled) => m.canceled,
            Some(WorkState::Unknown | WorkState::Failed) => 0,
        })
    }

    /// Find a unit by id. The stream backend keeps no descriptors after
    /// appending, so it always answers `None` there.
    #[must_use]
    pub fn find(&self, work_id: &str, state: Option<WorkState>) -> Option<Work> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.find(work_id, state),
            Backend::Stream(_) => None,
        }
    }

    /// Current lifecycle state of an id. On the stream backend this is a
    /// point lookup in the state mirror and requires `store_state`.
    #[must_use]
    pub fn work_state(&self, work_id: &str) -> Option<WorkState> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.work_state(work_id),
            Backend::Stream(queuing) => queuing.work_state(work_id),
        }
    }

    /// List the units a queue holds in a given state (memory backend).
    pub fn list_work(
        &self,
        queue_id: &str,
        state: Option<WorkState>,
    ) -> Result<Vec<Work>, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.list_work(queue_id, state),
            Backend::Stream(_) => Ok(Vec::new()),
        }
    }

    /// List work ids, same semantics as [`WorkManager::list_work`].
    pub fn list_work_ids(
        &self,
        queue_id: &str,
        state: Option<WorkState>,
    ) -> Result<Vec<String>, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.list_work_ids(queue_id, state),
            Backend::Stream(_) => Ok(Vec::new()),
        }
    }

    /// Prune completed history older than `before_ms`. The stream backend's
    /// log is append-only and keeps nothing prunable here.
    pub fn clear_completed_before(
        &self,
        queue_id: &str,
        before_ms: u128,
    ) -> Result<usize, WorkError> {
        match &self.inner.backend {
            Backend::Memory { queuing, .. } => queuing.clear_completed_before(queue_id, before_ms),
            Backend::Stream(_) => Ok(0),
        }
    }
}
