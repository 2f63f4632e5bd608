//! In-memory queuing backend.
//!
//! Keeps the scheduled/running/completed maps and a blocking container per
//! queue, purely in process memory. Everything is lost on restart, which is
//! why suspension drains and cancels instead of persisting for replay.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::WorkQueueDescriptor;
use crate::core::container::BlockingContainer;
use crate::core::error::WorkError;
use crate::core::metrics::{QueueCounters, QueueMetrics};
use crate::core::work::{Work, WorkState};

#[derive(Default)]
struct QueueMaps {
    scheduled: HashMap<String, Work>,
    running: HashMap<String, Work>,
    completed: HashMap<String, Work>,
}

/// Runtime state of one queue: its container, maps, and counters.
///
/// Map mutations happen under the single `maps` mutex; the container has its
/// own independent locking.
pub struct QueueRuntime {
    /// Queue id.
    pub queue_id: String,
    /// Handoff container between schedulers and workers.
    pub container: Arc<BlockingContainer>,
    maps: Mutex<QueueMaps>,
    counters: QueueCounters,
}

/// In-memory queuing backend shared by the manager and worker pools.
#[derive(Clone, Default)]
pub struct MemoryWorkQueuing {
    queues: Arc<RwLock<HashMap<String, Arc<QueueRuntime>>>>,
}

impl MemoryWorkQueuing {
    /// Create an empty backend; queues are added via [`Self::init_queue`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the runtime state for a configured queue.
    pub fn init_queue(&self, descriptor: &WorkQueueDescriptor) -> Result<(), WorkError> {
        let mut queues = self.queues.write();
        if queues.contains_key(&descriptor.id) {
            return Err(WorkError::InvalidConfig(format!(
                "work queue {} is already initialized",
                descriptor.id
            )));
        }
        let runtime = Arc::new(QueueRuntime {
            queue_id: descriptor.id.clone(),
            container: Arc::new(BlockingContainer::new(
                descriptor.id.clone(),
                descriptor.capacity,
            )),
            maps: Mutex::new(QueueMaps::default()),
            counters: QueueCounters::default(),
        });
        queues.insert(descriptor.id.clone(), runtime);
        Ok(())
    }

    /// Look up a queue's runtime.
    pub fn runtime(&self, queue_id: &str) -> Result<Arc<QueueRuntime>, WorkError> {
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

    /// Record a unit as scheduled and push it into the container, returning
    /// a metrics snapshot. Dedupes by id: `None` means the id was already
    /// scheduled and nothing was queued. May block when the queue is at
    /// capacity (non-reentrant callers only).
    pub fn work_schedule(
        &self,
        queue_id: &str,
        work: Work,
    ) -> Result<Option<QueueMetrics>, WorkError> {
        let runtime = self.runtime(queue_id)?;
        {
            let mut maps = runtime.maps.lock();
            if maps.scheduled.contains_key(&work.id) {
                debug!(work_id = %work.id, queue = queue_id, "already scheduled, skipping");
                return Ok(None);
            }
            maps.scheduled.insert(work.id.clone(), work.clone());
            runtime.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        // admission may block; never under the maps lock
        runtime.container.put(work);
        Ok(Some(runtime.counters.snapshot(queue_id)))
    }

    /// Hand a unit back for replay: running → scheduled, plus a non-blocking
    /// container handback.
    pub fn work_reschedule(&self, queue_id: &str, mut work: Work) -> Result<(), WorkError> {
        let runtime = self.runtime(queue_id)?;
        work.state = WorkState::Scheduled;
        {
            let mut maps = runtime.maps.lock();
            if maps.running.remove(&work.id).is_some() {
                runtime.counters.running.fetch_sub(1, Ordering::Relaxed);
            }
            if maps
                .scheduled
                .insert(work.id.clone(), work.clone())
                .is_none()
            {
                runtime.counters.scheduled.fetch_add(1, Ordering::Relaxed);
            }
        }
        runtime.container.put_unchecked(work);
        Ok(())
    }

    /// Move a unit from scheduled to running. A duplicate running id is a
    /// warning, not an error; the stored descriptor is overwritten.
    pub fn work_running(&self, queue_id: &str, work: Work) -> Result<(), WorkError> {
        let runtime = self.runtime(queue_id)?;
        let mut maps = runtime.maps.lock();
        if maps.scheduled.remove(&work.id).is_some() {
            runtime.counters.scheduled.fetch_sub(1, Ordering::Relaxed);
        }
        if maps.running.insert(work.id.clone(), work).is_some() {
            warn!(queue = queue_id, "work already running, overwriting descriptor");
        } else {
            runtime.counters.running.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Move a unit out of running into the completed history. A canceled
    /// outcome counts toward the canceled metric, not completed.
    pub fn work_completed(&self, queue_id: &str, work: Work) -> Result<(), WorkError> {
        let runtime = self.runtime(queue_id)?;
        let mut maps = runtime.maps.lock();
        if maps.running.remove(&work.id).is_some() {
            runtime.counters.running.fetch_sub(1, Ordering::Relaxed);
        }
        if work.state == WorkState::Canceled {
            runtime.counters.canceled.fetch_add(1, Ordering::Relaxed);
        } else {
            runtime.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        maps.completed.insert(work.id.clone(), work);
        Ok(())
    }

    /// Remove a unit that is still scheduled (map and container). Returns
    /// whether something was removed; a missing or already-running id is a
    /// no-op, never an error.
    pub fn cancel_scheduled(&self, queue_id: &str, work_id: &str) -> Result<bool, WorkError> {
        let runtime = self.runtime(queue_id)?;
        let mut maps = runtime.maps.lock();
        if maps.running.contains_key(work_id) {
            return Ok(false);
        }
        if maps.scheduled.remove(work_id).is_some() {
            runtime.counters.scheduled.fetch_sub(1, Ordering::Relaxed);
            runtime.counters.canceled.fetch_add(1, Ordering::Relaxed);
            drop(maps);
            runtime.container.remove(work_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the id is currently in the running set of the queue.
    pub fn is_running(&self, queue_id: &str, work_id: &str) -> Result<bool, WorkError> {
        let runtime = self.runtime(queue_id)?;
        let maps = runtime.maps.lock();
        Ok(maps.running.contains_key(work_id))
    }

    /// Drain the container, cancel everything still scheduled, and return
    /// the number of drained items. There is no durable store to replay
    /// from, so suspension on this backend discards scheduled work.
    pub fn set_suspending(&self, queue_id: &str) -> Result<usize, WorkError> {
        let runtime = self.runtime(queue_id)?;
        runtime.container.deactivate();
        let drained = runtime.container.drain(usize::MAX);
        let mut maps = runtime.maps.lock();
        let canceled = maps.scheduled.len();
        maps.scheduled.clear();
        runtime
            .counters
            .scheduled
            .fetch_sub(canceled as u64, Ordering::Relaxed);
        runtime
            .counters
            .canceled
            .fetch_add(canceled as u64, Ordering::Relaxed);
        Ok(drained.len())
    }

    /// Pause or resume consumption from the queue's container.
    pub fn set_active(&self, queue_id: &str, active: bool) -> Result<(), WorkError> {
        let runtime = self.runtime(queue_id)?;
        if active {
            runtime.container.activate();
        } else {
            runtime.container.deactivate();
        }
        Ok(())
    }

    /// Whether the queue's container currently feeds workers.
    pub fn is_active(&self, queue_id: &str) -> Result<bool, WorkError> {
        Ok(self.runtime(queue_id)?.container.is_active())
    }

    /// Find a work unit by id. `None` state means scheduled-or-running;
    /// terminal states search the completed history.
    #[must_use]
    pub fn find(&self, work_id: &str, state: Option<WorkState>) -> Option<Work> {
        let queues = self.queues.read();
        for runtime in queues.values() {
            let maps = runtime.maps.lock();
            let found = match state {
                None => maps
                    .scheduled
                    .get(work_id)
                    .or_else(|| maps.running.get(work_id)),
                Some(WorkState::Scheduled) => maps.scheduled.get(work_id),
                Some(WorkState::Running) => maps.running.get(work_id),
                Some(terminal) => maps
                    .completed
                    .get(work_id)
                    .filter(|w| w.state == terminal),
            };
            if let Some(work) = found {
                return Some(work.clone());
            }
        }
        None
    }

    /// Current lifecycle state of an id, scanning scheduled, running, then
    /// completed history.
    #[must_use]
    pub fn work_state(&self, work_id: &str) -> Option<WorkState> {
        let queues = self.queues.read();
        for runtime in queues.values() {
            let maps = runtime.maps.lock();
            if maps.scheduled.contains_key(work_id) {
                return Some(WorkState::Scheduled);
            }
            if maps.running.contains_key(work_id) {
                return Some(WorkState::Running);
            }
            if let Some(work) = maps.completed.get(work_id) {
                return Some(work.state);
            }
        }
        None
    }

    /// List work in a queue by state (`None` = scheduled and running).
    pub fn list_work(
        &self,
        queue_id: &str,
        state: Option<WorkState>,
    ) -> Result<Vec<Work>, WorkError> {
        let runtime = self.runtime(queue_id)?;
        let maps = runtime.maps.lock();
        let works = match state {
            None => maps
                .scheduled
                .values()
                .chain(maps.running.values())
                .cloned()
                .collect(),
            Some(WorkState::Scheduled) => maps.scheduled.values().cloned().collect(),
            Some(WorkState::Running) => maps.running.values().cloned().collect(),
            Some(terminal) => maps
                .completed
                .values()
                .filter(|w| w.state == terminal)
                .cloned()
                .collect(),
        };
        Ok(works)
    }

    /// List work ids in a queue by state.
    pub fn list_work_ids(
        &self,
        queue_id: &str,
        state: Option<WorkState>,
    ) -> Result<Vec<String>, WorkError> {
        Ok(self
            .list_work(queue_id, state)?
            .into_iter()
            .map(|w| w.id)
            .collect())
    }

    /// Prune completed history entries older than the given timestamp.
    /// Counters are cumulative and unaffected.
    pub fn clear_completed_before(
        &self,
        queue_id: &str,
        before_ms: u128,
    ) -> Result<usize, WorkError> {
        let runtime = self.runtime(queue_id)?;
        let mut maps = runtime.maps.lock();
        let before_len = maps.completed.len();
        maps.completed
            .retain(|_, w| w.completed_at_ms.is_none_or(|t| t >= before_ms));
        Ok(before_len - maps.completed.len())
    }

    /// Metrics snapshot for a queue.
    pub fn metrics(&self, queue_id: &str) -> Result<QueueMetrics, WorkError> {
        let runtime = self.runtime(queue_id)?;
        Ok(runtime.counters.snapshot(queue_id))
    }
}
