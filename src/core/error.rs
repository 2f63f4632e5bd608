//! Error types for the scheduling engine.
//!
//! These cover coordination-layer failures only (unknown queue, bad config,
//! backend trouble). Failures raised by a unit's own logic never surface
//! here; the execution wrapper converts them into state transitions and logs.

use thiserror::Error;

/// Errors produced by the work manager and its backends.
#[derive(Debug, Error)]
pub enum WorkError {
    /// No queue with the given id is configured.
    #[error("no such work queue: {0}")]
    UnknownQueue(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The manager is not in a state that allows the operation.
    #[error("work manager not started")]
    NotStarted,
    /// A work unit could not be serialized or deserialized.
    #[error("work serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific failure with context.
    #[error("queuing backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
