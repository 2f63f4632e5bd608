//! Log-stream queuing backend.
//!
//! Scheduling appends the serialized work to a partitioned log keyed by the
//! unit's partition key; there are no scheduled/running maps. Computation
//! workers own disjoint partition subsets (per-partition-key order is
//! preserved), consume records, and execute them through the transactional
//! wrapper. Lifecycle introspection is approximated from log lag, optionally
//! sharpened by mirroring states into the TTL state store.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{StreamSettings, WorkQueueDescriptor};
use crate::core::error::WorkError;
use crate::core::executor::{WorkExecutor, WorkOutcome};
use crate::core::metrics::QueueMetrics;
use crate::core::transaction::TransactionManager;
use crate::core::work::{Work, WorkContext, WorkState};
use crate::core::wrapper::run_in_transaction;
use crate::infra::log::{LogRecord, PartitionedLog};
use crate::infra::state::StateStore;

/// Recently-seen-id window used for best-effort replay dedupe.
const DEDUPE_WINDOW: usize = 1024;

/// Fixed-size ring of recently executed work-id hashes.
///
/// Best effort only: an id falls out of the window after `DEDUPE_WINDOW`
/// later executions, and a replay past the window runs again. Idempotent
/// works tolerate that by definition.
struct RecentIds {
    window: usize,
    slots: Vec<u64>,
    next: usize,
}

impl RecentIds {
    fn new(window: usize) -> Self {
        Self {
            window,
            slots: Vec::with_capacity(window),
            next: 0,
        }
    }

    /// Whether the id was seen within the window; records it if not.
    fn observe(&mut self, id: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let h = hasher.finish();
        if self.slots.contains(&h) {
            return true;
        }
        if self.slots.len() < self.window {
            self.slots.push(h);
        } else {
            self.slots[self.next] = h;
            self.next = (self.next + 1) % self.window;
        }
        false
    }
}

/// Per-queue stream state: the log, a processing toggle, and the dedupe ring.
struct StreamQueue {
    queue_id: String,
    log: PartitionedLog,
    max_threads: usize,
    active: AtomicBool,
    canceled: AtomicU64,
    seen: Mutex<RecentIds>,
}

/// Log-stream queuing backend. Cheap to share behind an [`Arc`].
pub struct StreamWorkQueuing {
    settings: StreamSettings,
    store: Arc<StateStore>,
    queues: RwLock<HashMap<String, Arc<StreamQueue>>>,
    running: Arc<Mutex<HashMap<String, Arc<WorkContext>>>>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Everything one computation worker thread needs.
struct WorkerShared {
    queue: Arc<StreamQueue>,
    store: Arc<StateStore>,
    settings: StreamSettings,
    running: Arc<Mutex<HashMap<String, Arc<WorkContext>>>>,
    shutdown: Arc<AtomicBool>,
    executor: Arc<dyn WorkExecutor>,
    tm: Arc<dyn TransactionManager>,
}

impl StreamWorkQueuing {
    /// Create a backend with the given tuning and a fresh state store.
    #[must_use]
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            store: Arc::new(StateStore::new()),
            queues: RwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Shared state store, exposed for tests and embedding applications.
    #[must_use]
    pub fn state_store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Initialize the log for a configured queue.
    pub fn init_queue(&self, descriptor: &WorkQueueDescriptor) -> Result<(), WorkError> {
        let mut queues = self.queues.write();
        if queues.contains_key(&descriptor.id) {
            return Err(WorkError::InvalidConfig(format!(
                "work queue {} is already initialized",
                descriptor.id
            )));
        }
        // the in-process log cannot rebalance partitions across processes,
        // so the over-provisioning multiplier collapses
        let partitions = self.settings.partitions_for(descriptor.max_threads, false);
        let log = PartitionedLog::new(descriptor.id.clone(), partitions);
        queues.insert(
            descriptor.id.clone(),
            Arc::new(StreamQueue {
                queue_id: descriptor.id.clone(),
                log,
                max_threads: descriptor.max_threads,
                active: AtomicBool::new(descriptor.processing_enabled),
                canceled: AtomicU64::new(0),
                seen: Mutex::new(RecentIds::new(DEDUPE_WINDOW)),
            }),
        );
        Ok(())
    }

    fn queue(&self, queue_id: &str) -> Result<Arc<StreamQueue>, WorkError> {
        self.queues
            .read()
            .get(queue_id)
            .cloned()
            .ok_or_else(|| WorkError::UnknownQueue(queue_id.to_string()))
    }

    /// Ids of all initialized queues.
    #[must_use]
    pub fn queue_ids(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    /// Serialize and append a work unit. Oversized payloads go through the
    /// state store; coalescing units record their latest offset so stale
    /// replays are skipped.
    pub fn work_schedule(&self, queue_id: &str, mut work: Work) -> Result<bool, WorkError> {
        let queue = self.queue(queue_id)?;
        work.mark_scheduled();
        let bytes = serde_json::to_vec(&work)?;
        let ttl = Some(self.settings.state_ttl());
        let record = if bytes.len() > self.settings.overflow_threshold_bytes {
            let overflow_key = self.store.put_overflow(&work.id, bytes, ttl);
            debug!(work_id = %work.id, queue = queue_id, "payload offloaded to state store");
            LogRecord::overflow(work.partition_key.clone(), overflow_key)
        } else {
            LogRecord::inline(work.partition_key.clone(), bytes)
        };
        // the mirror must land before the record becomes visible: a fast
        // worker writing Running/Completed could otherwise be overwritten
        // by a late Scheduled entry
        if self.settings.store_state {
            self.store.put_state(&work.id, WorkState::Scheduled, ttl);
        }
        let offset = queue.log.append(record);
        if work.coalescing {
            self.store.put_last_offset(&work.id, offset.offset, ttl);
        }
        Ok(true)
    }

    /// Request cancellation of a unit that is still scheduled. Appended
    /// records cannot be removed, so this raises a flag the consuming worker
    /// honors; it requires state mirroring to know the unit has not started.
    pub fn cancel_scheduled(&self, queue_id: &str, work_id: &str) -> Result<bool, WorkError> {
        self.queue(queue_id)?;
        if !self.settings.store_state {
            debug!(work_id, "cancel ignored: state mirroring is disabled");
            return Ok(false);
        }
        if self.store.get_state(work_id) == Some(WorkState::Scheduled) {
            self.store
                .request_cancel(work_id, Some(self.settings.state_ttl()));
            return Ok(true);
        }
        Ok(false)
    }

    /// Request cooperative cancellation of a running unit.
    pub fn cancel_running(&self, work_id: &str) -> bool {
        if let Some(ctx) = self.running.lock().get(work_id) {
            ctx.request_cancel();
            return true;
        }
        false
    }

    /// Mirrored lifecycle state, available when `store_state` is on.
    #[must_use]
    pub fn work_state(&self, work_id: &str) -> Option<WorkState> {
        if !self.settings.store_state {
            return None;
        }
        self.store.get_state(work_id)
    }

    /// Whether a unit is currently executing in this process.
    #[must_use]
    pub fn is_running(&self, work_id: &str) -> bool {
        self.running.lock().contains_key(work_id)
    }

    /// Pause or resume the computation workers of a queue.
    pub fn set_active(&self, queue_id: &str, active: bool) -> Result<(), WorkError> {
        self.queue(queue_id)?
            .active
            .store(active, Ordering::Release);
        Ok(())
    }

    /// Whether a queue's workers currently consume.
    pub fn is_active(&self, queue_id: &str) -> Result<bool, WorkError> {
        Ok(self.queue(queue_id)?.active.load(Ordering::Acquire))
    }

    /// Uncommitted record count of a queue.
    pub fn lag(&self, queue_id: &str) -> Result<u64, WorkError> {
        Ok(self.queue(queue_id)?.log.total_lag())
    }

    /// Uncommitted record count across all queues.
    #[must_use]
    pub fn total_lag(&self) -> u64 {
        self.queues
            .read()
            .values()
            .map(|q| q.log.total_lag())
            .sum()
    }

    /// Lag-derived metrics approximation. A unit counts as running when its
    /// partition has lag; at most one per partition can actually execute.
    pub fn metrics(&self, queue_id: &str) -> Result<QueueMetrics, WorkError> {
        let queue = self.queue(queue_id)?;
        let lag = queue.log.total_lag();
        let running = lag.min(queue.log.partition_count() as u64);
        Ok(QueueMetrics {
            queue_id: queue_id.to_string(),
            scheduled: lag - running,
            running,
            completed: queue.log.total_committed(),
            canceled: queue.canceled.load(Ordering::Relaxed),
        })
    }

    /// Spawn the computation workers: `max_threads` per queue, each owning a
    /// disjoint subset of partitions.
    pub fn start(
        &self,
        executor: Arc<dyn WorkExecutor>,
        tm: Arc<dyn TransactionManager>,
    ) -> Result<(), WorkError> {
        let queues: Vec<Arc<StreamQueue>> = self.queues.read().values().cloned().collect();
        let mut workers = self.workers.lock();
        for queue in queues {
            let partitions = queue.log.partition_count();
            for w in 0..queue.max_threads.min(partitions) {
                let owned: Vec<usize> = (0..partitions)
                    .filter(|p| p % queue.max_threads == w)
                    .collect();
                let shared = WorkerShared {
                    queue: Arc::clone(&queue),
                    store: Arc::clone(&self.store),
                    settings: self.settings.clone(),
                    running: Arc::clone(&self.running),
                    shutdown: Arc::clone(&self.shutdown),
                    executor: Arc::clone(&executor),
                    tm: Arc::clone(&tm),
                };
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| WorkError::Backend(format!("worker runtime: {e}")))?;
                let name = format!("workyard-stream-{}-{w}", queue.queue_id);
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker_loop(shared, owned, rt))
                    .map_err(|e| WorkError::Backend(format!("spawn {name}: {e}")))?;
                workers.push(handle);
            }
            info!(queue = %queue.queue_id, partitions, "stream queue processing started");
        }
        Ok(())
    }

    /// Stop the workers: raise the shutdown flag, ask in-flight units to
    /// suspend, and join against the deadline. Returns whether every worker
    /// exited in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::Release);
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
        match rx.recv_deadline(Instant::now() + timeout) {
            Ok(()) => true,
            Err(_) => {
                warn!("stream workers did not stop within the timeout");
                false
            }
        }
    }
}

fn worker_loop(shared: WorkerShared, owned: Vec<usize>, rt: tokio::runtime::Runtime) {
    let mut positions: Vec<u64> = owned
        .iter()
        .map(|&p| shared.queue.log.committed(p))
        .collect();
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut progressed = false;
        if shared.queue.active.load(Ordering::Acquire) {
            for (slot, &partition) in owned.iter().enumerate() {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let offset = positions[slot];
                if offset >= shared.queue.log.end_offset(partition) {
                    continue;
                }
                let Some(record) = shared.queue.log.read(partition, offset) else {
                    continue;
                };
                if process_record(&shared, &rt, &record, offset) {
                    shared.queue.log.commit(partition, offset);
                    positions[slot] += 1;
                    progressed = true;
                }
            }
        }
        if !progressed {
            thread::sleep(shared.settings.poll_interval());
        }
    }
}

/// Consume one record. Returns whether it was fully consumed and its offset
/// can be committed; `false` leaves it for replay (suspension at shutdown).
fn process_record(
    shared: &WorkerShared,
    rt: &tokio::runtime::Runtime,
    record: &LogRecord,
    offset: u64,
) -> bool {
    let queue_id = &shared.queue.queue_id;
    let ttl = Some(shared.settings.state_ttl());

    let bytes = match &record.overflow_key {
        Some(key) => match shared.store.get_overflow(key) {
            Some(bytes) => bytes,
            None => {
                warn!(queue = %queue_id, key = %key, "overflow payload expired, skipping record");
                return true;
            }
        },
        None => record.payload.clone(),
    };
    let mut work: Work = match serde_json::from_slice(&bytes) {
        Ok(work) => work,
        Err(e) => {
            warn!(queue = %queue_id, "undeserializable record skipped: {e}");
            return true;
        }
    };

    // a coalescing unit only runs at its latest appended offset
    if work.coalescing {
        if let Some(last) = shared.store.get_last_offset(&work.id) {
            if offset < last {
                debug!(work_id = %work.id, offset, last, "stale coalesced record skipped");
                return true;
            }
        }
    }

    if work.idempotent && shared.queue.seen.lock().observe(&work.id) {
        debug!(work_id = %work.id, "replay of idempotent work within dedupe window skipped");
        return true;
    }

    if shared.settings.store_state && shared.store.is_cancel_requested(&work.id) {
        shared.queue.canceled.fetch_add(1, Ordering::Relaxed);
        shared.store.put_state(&work.id, WorkState::Canceled, ttl);
        shared.store.clear_cancel(&work.id);
        debug!(work_id = %work.id, "canceled before start");
        return true;
    }

    work.mark_running();
    if shared.settings.store_state {
        shared.store.put_state(&work.id, WorkState::Running, ttl);
    }
    let ctx = Arc::new(WorkContext::new());
    shared
        .running
        .lock()
        .insert(work.id.clone(), Arc::clone(&ctx));

    let outcome = rt.block_on(run_in_transaction(
        shared.executor.as_ref(),
        shared.tm.as_ref(),
        &work,
        &ctx,
    ));

    shared.running.lock().remove(&work.id);

    let (state, commit) = match outcome {
        WorkOutcome::Completed => (WorkState::Completed, true),
        WorkOutcome::Failed => (WorkState::Failed, true),
        WorkOutcome::Canceled => {
            shared.queue.canceled.fetch_add(1, Ordering::Relaxed);
            (WorkState::Canceled, true)
        }
        // leave the record uncommitted so a restart replays it
        WorkOutcome::Suspended => (WorkState::Scheduled, false),
    };
    if shared.settings.store_state {
        shared.store.put_state(&work.id, state, ttl);
    }
    commit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_ids_window() {
        let mut seen = RecentIds::new(3);
        assert!(!seen.observe("a"));
        assert!(seen.observe("a"));
        assert!(!seen.observe("b"));
        assert!(!seen.observe("c"));
        // "d" evicts the oldest slot; "a" falls out of the window
        assert!(!seen.observe("d"));
        assert!(!seen.observe("a"));
    }

    fn backend(settings: StreamSettings, descriptor: &WorkQueueDescriptor) -> StreamWorkQueuing {
        let backend = StreamWorkQueuing::new(settings);
        backend.init_queue(descriptor).unwrap();
        backend
    }

    #[test]
    fn test_schedule_appends_and_lags() {
        let b = backend(
            StreamSettings::default(),
            &WorkQueueDescriptor::new("q").with_max_threads(2),
        );
        let work = Work::with_id("w1", "cat", serde_json::Value::Null);
        assert!(b.work_schedule("q", work).unwrap());
        assert_eq!(b.lag("q").unwrap(), 1);
        let metrics = b.metrics("q").unwrap();
        assert_eq!(metrics.running, 1); // lag approximation
        assert_eq!(metrics.completed, 0);
    }

    #[test]
    fn test_overflow_roundtrip() {
        let settings = StreamSettings {
            overflow_threshold_bytes: 64,
            ..StreamSettings::default()
        };
        let b = backend(settings, &WorkQueueDescriptor::new("q").with_max_threads(1));
        let payload = serde_json::json!({"blob": "x".repeat(500)});
        let work = Work::with_id("big", "cat", payload.clone());
        b.work_schedule("q", work).unwrap();

        let queue = b.queue("q").unwrap();
        let record = queue.log.read(0, 0).unwrap();
        assert!(record.payload.is_empty());
        let key = record.overflow_key.as_deref().unwrap();
        let bytes = b.store.get_overflow(key).unwrap();
        let back: Work = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, "big");
        assert_eq!(back.payload, payload);
    }

    #[test]
    fn test_cancel_requires_state_mirroring() {
        let b = backend(
            StreamSettings::default(),
            &WorkQueueDescriptor::new("q").with_max_threads(1),
        );
        b.work_schedule("q", Work::with_id("w1", "cat", serde_json::Value::Null))
            .unwrap();
        assert!(!b.cancel_scheduled("q", "w1").unwrap());

        let b = backend(
            StreamSettings {
                store_state: true,
                ..StreamSettings::default()
            },
            &WorkQueueDescriptor::new("q").with_max_threads(1),
        );
        b.work_schedule("q", Work::with_id("w1", "cat", serde_json::Value::Null))
            .unwrap();
        assert_eq!(b.work_state("w1"), Some(WorkState::Scheduled));
        assert!(b.cancel_scheduled("q", "w1").unwrap());
        assert!(b.state_store().is_cancel_requested("w1"));
    }

    #[test]
    fn test_partition_count_collapses_without_rebalance() {
        let b = backend(
            StreamSettings::default(),
            &WorkQueueDescriptor::new("q").with_max_threads(4),
        );
        let queue = b.queue("q").unwrap();
        assert_eq!(queue.log.partition_count(), 4);
    }
}
