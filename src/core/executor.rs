//! Work execution trait and outcome taxonomy.

use async_trait::async_trait;
use thiserror::Error;

use super::work::{Work, WorkContext};

/// How a single execution attempt ended, from the engine's point of view.
///
/// Three classes matter to the retry wrapper: success, an expected transient
/// concurrency conflict, and everything else.
#[derive(Debug, Error)]
pub enum ExecError {
    /// An optimistic-locking collision or equivalent transient conflict.
    /// Retried against the unit's retry budget, rolled back each time.
    #[error("concurrency conflict: {0}")]
    Conflict(String),
    /// The unit observed a cancellation/suspension request and stopped
    /// cooperatively. Expected during shutdown; logged at debug level only.
    #[error("canceled")]
    Canceled,
    /// Unhandled logic failure. The transaction rolls back and the unit is
    /// marked failed; not retried automatically.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Terminal outcome of one wrapped execution, after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The unit ran to completion and the transaction committed.
    Completed,
    /// The unit acknowledged a suspension request; partial state committed
    /// and the unit will be replayed.
    Suspended,
    /// The unit stopped on a cancellation request.
    Canceled,
    /// The unit failed (conflict budget exhausted or unhandled error).
    Failed,
}

/// Business logic for running work units.
///
/// One executor serves the whole manager; it dispatches on the work's
/// category and payload. Implementations are expected to poll
/// [`WorkContext::is_suspending`] and [`WorkContext::is_cancel_requested`]
/// at safe points and return [`ExecError::Canceled`] (or acknowledge via
/// [`WorkContext::suspended`]) when asked to stop.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone)]
/// struct Housekeeping;
///
/// #[async_trait]
/// impl WorkExecutor for Housekeeping {
///     async fn execute(&self, work: &Work, ctx: &WorkContext) -> Result<(), ExecError> {
///         for batch in batches(&work.payload) {
///             if ctx.is_suspending() {
///                 save_checkpoint(&batch)?;
///                 ctx.suspended();
///                 return Ok(());
///             }
///             process(batch).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait WorkExecutor: Send + Sync + 'static {
    /// Run one unit of work. Called on a worker thread inside a transaction
    /// boundary managed by the engine.
    async fn execute(&self, work: &Work, ctx: &WorkContext) -> Result<(), ExecError>;

    /// Cleanup hook invoked exactly once per execution, after the final
    /// attempt, regardless of outcome. Close sessions, release borrowed
    /// credentials.
    async fn cleanup(&self, work: &Work, outcome: WorkOutcome) {
        let _ = (work, outcome);
    }
}
