//! Core scheduling abstractions.

pub mod container;
pub mod error;
pub mod executor;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod transaction;
pub mod work;
pub mod wrapper;

pub use container::{BlockingContainer, WorkerScope};
pub use error::{AppResult, WorkError};
pub use executor::{ExecError, WorkExecutor, WorkOutcome};
pub use manager::{SchedulePolicy, WorkManager};
pub use metrics::{QueueCounters, QueueMetrics};
pub use pool::{CompletionSynchronizer, WorkerPool};
pub use transaction::{LocalTransactionManager, Transaction, TransactionManager, TxStatus};
pub use work::{Progress, Work, WorkContext, WorkState};
pub use wrapper::run_in_transaction;
