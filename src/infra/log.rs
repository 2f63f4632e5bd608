//! Partitioned append-only log backing the stream queuing backend.
//!
//! Records are routed to a partition by hashing their key, so all records
//! sharing a partition key land on one partition and keep their relative
//! order. Consumers track a committed position per partition; lag (appended
//! minus committed) is how the stream backend approximates its scheduled and
//! running counts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One appended record: partition key plus serialized payload.
///
/// When the payload exceeded the overflow threshold at append time, the bytes
/// live in the state store instead and `overflow_key` names them; `payload`
/// is empty in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Partition/ordering key.
    pub key: String,
    /// Serialized payload, empty when offloaded.
    pub payload: Vec<u8>,
    /// State-store key holding the payload, for oversized records.
    pub overflow_key: Option<String>,
}

impl LogRecord {
    /// Record carrying its payload inline.
    #[must_use]
    pub fn inline(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            overflow_key: None,
        }
    }

    /// Record whose payload was moved to the state store.
    #[must_use]
    pub fn overflow(key: impl Into<String>, overflow_key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: Vec::new(),
            overflow_key: Some(overflow_key.into()),
        }
    }
}

/// Position of a record within the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogOffset {
    /// Partition index.
    pub partition: usize,
    /// Zero-based offset within the partition.
    pub offset: u64,
}

struct Partition {
    records: Vec<LogRecord>,
    committed: u64,
}

/// In-process partitioned append-only log.
///
/// Append-only per partition; nothing is ever removed. Commit positions only
/// move forward.
pub struct PartitionedLog {
    name: String,
    partitions: Vec<Mutex<Partition>>,
}

impl PartitionedLog {
    /// Create a log with a fixed partition count (at least 1).
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            name: name.into(),
            partitions: (0..partitions)
                .map(|_| {
                    Mutex::new(Partition {
                        records: Vec::new(),
                        committed: 0,
                    })
                })
                .collect(),
        }
    }

    /// Log name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition a key hashes to.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Append a record to the partition its key hashes to.
    pub fn append(&self, record: LogRecord) -> LogOffset {
        let partition = self.partition_for(&record.key);
        let mut p = self.partitions[partition].lock();
        let offset = p.records.len() as u64;
        p.records.push(record);
        LogOffset { partition, offset }
    }

    /// Read the record at a position, if appended.
    #[must_use]
    pub fn read(&self, partition: usize, offset: u64) -> Option<LogRecord> {
        let p = self.partitions.get(partition)?.lock();
        p.records.get(offset as usize).cloned()
    }

    /// Advance the committed position of a partition past `offset`. Commit
    /// positions never move backwards.
    pub fn commit(&self, partition: usize, offset: u64) {
        if let Some(p) = self.partitions.get(partition) {
            let mut p = p.lock();
            p.committed = p.committed.max(offset + 1);
        }
    }

    /// Committed (consumed) record count of a partition.
    #[must_use]
    pub fn committed(&self, partition: usize) -> u64 {
        self.partitions
            .get(partition)
            .map(|p| p.lock().committed)
            .unwrap_or(0)
    }

    /// Appended record count of a partition.
    #[must_use]
    pub fn end_offset(&self, partition: usize) -> u64 {
        self.partitions
            .get(partition)
            .map(|p| p.lock().records.len() as u64)
            .unwrap_or(0)
    }

    /// Uncommitted record count of a partition.
    #[must_use]
    pub fn lag(&self, partition: usize) -> u64 {
        self.partitions
            .get(partition)
            .map(|p| {
                let p = p.lock();
                p.records.len() as u64 - p.committed
            })
            .unwrap_or(0)
    }

    /// Uncommitted record count across all partitions.
    #[must_use]
    pub fn total_lag(&self) -> u64 {
        (0..self.partitions.len()).map(|i| self.lag(i)).sum()
    }

    /// Committed record count across all partitions.
    #[must_use]
    pub fn total_committed(&self) -> u64 {
        (0..self.partitions.len())
            .map(|i| self.committed(i))
            .sum()
    }

    /// Whether partitions can be redistributed across processes. The
    /// in-process log cannot, so over-provisioning partitions buys nothing.
    #[must_use]
    pub fn supports_rebalance(&self) -> bool {
        false
    }
}
