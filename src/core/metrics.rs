//! Per-queue metrics snapshot and counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time metrics for one queue.
///
/// In cluster mode (stream backend) these are approximations derived from
/// log lag; no logic should rely on them for correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Queue id the snapshot belongs to.
    pub queue_id: String,
    /// Units recorded as scheduled and not yet started.
    pub scheduled: u64,
    /// Units currently executing.
    pub running: u64,
    /// Units that completed or failed.
    pub completed: u64,
    /// Units canceled before or during execution.
    pub canceled: u64,
}

/// Thread-safe counter block backing a [`QueueMetrics`] snapshot.
#[derive(Debug, Default)]
pub struct QueueCounters {
    /// Scheduled, not yet started.
    pub scheduled: AtomicU64,
    /// Currently executing.
    pub running: AtomicU64,
    /// Completed or failed.
    pub completed: AtomicU64,
    /// Canceled before or during execution.
    pub canceled: AtomicU64,
}

impl QueueCounters {
    /// Get a snapshot of current counters.
    #[must_use]
    pub fn snapshot(&self, queue_id: &str) -> QueueMetrics {
        QueueMetrics {
            queue_id: queue_id.to_string(),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}
