//! Configuration types: queue descriptors, backend selection, stream tuning.

pub mod queue;

pub use queue::{
    QueuingBackendKind, StreamSettings, WorkManagerConfig, WorkQueueDescriptor, DEFAULT_QUEUE_ID,
};
