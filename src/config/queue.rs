//! Queue descriptors and manager configuration.
//!
//! Configuration is plain JSON deserialized with serde and validated
//! explicitly before a manager is built. Every category maps to exactly one
//! queue; categories nobody claims fall back to the default queue, which is
//! auto-created when the configuration omits it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::error::WorkError;

/// Id of the fallback queue for unmapped categories.
pub const DEFAULT_QUEUE_ID: &str = "default";

fn default_max_threads() -> usize {
    num_cpus::get()
}

fn default_true() -> bool {
    true
}

/// Static description of one work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueDescriptor {
    /// Queue id, unique within a manager.
    pub id: String,
    /// Display name for introspection.
    #[serde(default)]
    pub name: Option<String>,
    /// Categories routed to this queue.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Admission capacity; `None` is unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Fixed worker count of the queue's pool.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Whether workers consume from this queue at startup.
    #[serde(default = "default_true")]
    pub processing_enabled: bool,
    /// Whether scheduling into this queue is accepted at all.
    #[serde(default = "default_true")]
    pub queuing_enabled: bool,
}

impl WorkQueueDescriptor {
    /// Descriptor with defaults: unbounded, one thread per CPU, enabled.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            categories: Vec::new(),
            capacity: None,
            max_threads: default_max_threads(),
            processing_enabled: true,
            queuing_enabled: true,
        }
    }

    /// Set the categories routed to this queue.
    #[must_use]
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Set the admission capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the fixed worker count.
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }
}

/// Which queuing backend the manager runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuingBackendKind {
    /// In-process maps and containers; nothing survives a restart.
    #[default]
    Memory,
    /// Partitioned append-only log plus TTL state store.
    Stream,
}

fn default_overflow_threshold() -> usize {
    1_000_000
}

fn default_state_ttl_secs() -> u64 {
    3_600
}

fn default_over_provisioning() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Tuning knobs of the stream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Payloads serialized above this size are moved to the state store.
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold_bytes: usize,
    /// Mirror every lifecycle transition into the state store. Required for
    /// cancellation and point state lookups on this backend.
    #[serde(default)]
    pub store_state: bool,
    /// TTL of state-store entries (mirrored states, cancel flags, overflow
    /// payloads, coalescing offsets).
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
    /// Partition multiplier applied when the log supports redistributing
    /// partitions across processes; collapses to 1 when it does not.
    #[serde(default = "default_over_provisioning")]
    pub over_provisioning: u32,
    /// Worker sleep between empty sweeps.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            overflow_threshold_bytes: default_overflow_threshold(),
            store_state: false,
            state_ttl_secs: default_state_ttl_secs(),
            over_provisioning: default_over_provisioning(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StreamSettings {
    /// TTL as a duration.
    #[must_use]
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Partition count for a queue with the given worker count.
    #[must_use]
    pub fn partitions_for(&self, max_threads: usize, redistributable: bool) -> usize {
        if max_threads <= 1 {
            return 1;
        }
        let factor = if redistributable {
            self.over_provisioning.max(1) as usize
        } else {
            1
        };
        factor * max_threads
    }
}

/// Full manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkManagerConfig {
    /// Backend selection, fixed for the manager's lifetime.
    #[serde(default)]
    pub backend: QueuingBackendKind,
    /// Configured queues.
    #[serde(default)]
    pub queues: Vec<WorkQueueDescriptor>,
    /// Stream backend tuning, ignored by the memory backend.
    #[serde(default)]
    pub stream: StreamSettings,
}

impl WorkManagerConfig {
    /// Parse a configuration from a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, WorkError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants: unique queue ids, nonzero worker counts.
    pub fn validate(&self) -> Result<(), WorkError> {
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.id.is_empty() {
                return Err(WorkError::InvalidConfig("queue id is empty".into()));
            }
            if !seen.insert(queue.id.as_str()) {
                return Err(WorkError::InvalidConfig(format!(
                    "duplicate queue id {}",
                    queue.id
                )));
            }
            if queue.max_threads == 0 {
                return Err(WorkError::InvalidConfig(format!(
                    "queue {} has max_threads 0",
                    queue.id
                )));
            }
        }
        Ok(())
    }

    /// Ensure the default queue exists, appending a default descriptor when
    /// the configuration omits it.
    pub fn ensure_default_queue(&mut self) {
        if !self.queues.iter().any(|q| q.id == DEFAULT_QUEUE_ID) {
            self.queues.push(WorkQueueDescriptor::new(DEFAULT_QUEUE_ID));
        }
    }

    /// Category → queue-id routing table. Duplicate claims keep the first
    /// mapping and log an error.
    #[must_use]
    pub fn category_routing(&self) -> HashMap<String, String> {
        let mut routing: HashMap<String, String> = HashMap::new();
        for queue in &self.queues {
            for category in &queue.categories {
                if let Some(winner) = routing.get(category) {
                    error!(
                        category = %category,
                        winner = %winner,
                        loser = %queue.id,
                        "category claimed by two queues, keeping the first"
                    );
                } else {
                    routing.insert(category.clone(), queue.id.clone());
                }
            }
        }
        routing
    }

    /// Descriptor lookup by queue id.
    #[must_use]
    pub fn queue(&self, queue_id: &str) -> Option<&WorkQueueDescriptor> {
        self.queues.iter().find(|q| q.id == queue_id)
    }
}
