//! Work unit descriptor, lifecycle states, and the execution context used for
//! the cooperative suspend handshake.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;

/// Lifecycle state of a work unit.
///
/// States are mutually exclusive. The normal path is
/// `Unknown → Scheduled → Running → Completed`; terminal branching allows
/// `Failed` and `Canceled`, and a running unit moves back to `Scheduled`
/// when the engine shuts down mid-execution (requeue for replay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Not yet submitted, or forgotten after a rolled-back scheduling.
    Unknown,
    /// Recorded by the queuing backend, waiting for a worker.
    Scheduled,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an unhandled failure.
    Failed,
    /// Removed before it started, or dropped during suspension.
    Canceled,
}

/// Numeric/textual progress reported by a running unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Percentage in `[0, 100]` when the unit reports one.
    pub percent: Option<f32>,
    /// Current step count.
    pub current: Option<u64>,
    /// Total step count.
    pub total: Option<u64>,
}

impl Progress {
    /// Progress expressed as a completed/total step pair.
    #[must_use]
    pub fn of(current: u64, total: u64) -> Self {
        Self {
            percent: None,
            current: Some(current),
            total: Some(total),
        }
    }
}

/// A serializable unit of deferred work.
///
/// The descriptor carries identity and routing data; the logic that runs it
/// lives in the [`WorkExecutor`](crate::core::WorkExecutor) the manager was
/// built with. The payload is opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    /// Globally unique id, stable for the unit's lifetime.
    pub id: String,
    /// Routing key resolved to a queue by the manager.
    pub category: String,
    /// Human-readable title for introspection.
    pub title: String,
    /// Opaque payload interpreted by the executor.
    pub payload: serde_json::Value,
    /// Originating principal, when known.
    pub user: Option<String>,
    /// Target resources (e.g. document ids) this unit affects.
    pub doc_ids: Vec<String>,
    /// Partitioning/ordering key for the log-stream backend.
    pub partition_key: String,
    /// Whether replaying this unit is safe (enables best-effort dedupe).
    pub idempotent: bool,
    /// Whether later submissions supersede earlier ones with the same id.
    pub coalescing: bool,
    /// Additional attempts granted on concurrency conflicts.
    pub retry_budget: u32,
    /// Lifecycle state.
    pub state: WorkState,
    /// Progress reported by the unit.
    pub progress: Progress,
    /// When the unit was scheduled (ms since epoch).
    pub scheduled_at_ms: Option<u128>,
    /// When execution started (ms since epoch).
    pub started_at_ms: Option<u128>,
    /// When execution finished (ms since epoch).
    pub completed_at_ms: Option<u128>,
}

impl Work {
    /// Create a work unit with a fresh UUID id in the given category.
    #[must_use]
    pub fn new(category: impl Into<String>, payload: serde_json::Value) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self::with_id(id, category, payload)
    }

    /// Create a work unit with a caller-chosen id.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        category: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let id = id.into();
        Self {
            partition_key: id.clone(),
            id,
            category: category.into(),
            title: String::new(),
            payload,
            user: None,
            doc_ids: Vec::new(),
            idempotent: false,
            coalescing: false,
            retry_budget: 0,
            state: WorkState::Unknown,
            progress: Progress::default(),
            scheduled_at_ms: None,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    /// Set the human-readable title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the partition key used for routing/ordering in the stream backend.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = key.into();
        self
    }

    /// Mark the unit idempotent (safe to replay).
    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Mark the unit coalescing (latest submission wins per id).
    #[must_use]
    pub fn coalescing(mut self) -> Self {
        self.coalescing = true;
        self
    }

    /// Set the retry budget for concurrency conflicts.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Transition to `Scheduled` and stamp the scheduling time.
    pub fn mark_scheduled(&mut self) {
        self.state = WorkState::Scheduled;
        self.scheduled_at_ms = Some(now_ms());
    }

    /// Transition to `Running` and stamp the start time.
    pub fn mark_running(&mut self) {
        self.state = WorkState::Running;
        self.started_at_ms = Some(now_ms());
    }

    /// Transition to a terminal state and stamp the completion time.
    pub fn mark_finished(&mut self, state: WorkState) {
        self.state = state;
        self.completed_at_ms = Some(now_ms());
    }
}

/// Per-execution context shared between the engine and a running unit.
///
/// Carries the two-flag suspend handshake: the engine sets `suspending` when
/// it wants the unit to stop; the unit polls [`WorkContext::is_suspending`]
/// at safe points and calls [`WorkContext::suspended`] after saving whatever
/// partial state it wants committed. A separate cancel flag covers explicit
/// cancellation requests.
#[derive(Debug, Default)]
pub struct WorkContext {
    suspending: AtomicBool,
    suspended: AtomicBool,
    cancel_requested: AtomicBool,
}

impl WorkContext {
    /// Create a fresh context for one execution.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running unit to suspend itself at its next safe point.
    pub fn request_suspend(&self) {
        self.suspending.store(true, Ordering::Release);
    }

    /// Whether the engine asked this unit to suspend.
    #[must_use]
    pub fn is_suspending(&self) -> bool {
        self.suspending.load(Ordering::Acquire)
    }

    /// Acknowledge suspension. The unit should have persisted any partial
    /// state it wants committed before calling this.
    pub fn suspended(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Whether the unit acknowledged a suspension request.
    #[must_use]
    pub fn was_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation of this execution.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}
