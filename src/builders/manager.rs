//! Fluent construction of a [`WorkManager`].

use std::sync::Arc;

use crate::config::WorkManagerConfig;
use crate::core::error::WorkError;
use crate::core::executor::WorkExecutor;
use crate::core::manager::WorkManager;
use crate::core::transaction::{LocalTransactionManager, TransactionManager};

/// Builder for a [`WorkManager`].
///
/// The executor is the only required part; configuration defaults to a
/// single default queue on the memory backend, and the transaction manager
/// defaults to local unit-of-work objects.
///
/// # Example
///
/// ```rust,ignore
/// let manager = WorkManagerBuilder::new()
///     .config_json(r#"{"queues": [{"id": "imports", "categories": ["import"]}]}"#)?
///     .executor(Arc::new(MyExecutor))
///     .build()?;
/// manager.start()?;
/// ```
#[derive(Default)]
pub struct WorkManagerBuilder {
    config: Option<WorkManagerConfig>,
    executor: Option<Arc<dyn WorkExecutor>>,
    tm: Option<Arc<dyn TransactionManager>>,
}

impl WorkManagerBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already parsed configuration.
    #[must_use]
    pub fn config(mut self, config: WorkManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn config_json(mut self, json: &str) -> Result<Self, WorkError> {
        self.config = Some(WorkManagerConfig::from_json_str(json)?);
        Ok(self)
    }

    /// Set the executor that runs all work units.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn WorkExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Bind transaction boundaries to the embedding application's manager.
    #[must_use]
    pub fn transaction_manager(mut self, tm: Arc<dyn TransactionManager>) -> Self {
        self.tm = Some(tm);
        self
    }

    /// Build the manager. Call [`WorkManager::start`] afterwards to spawn
    /// the workers.
    pub fn build(self) -> Result<WorkManager, WorkError> {
        let executor = self
            .executor
            .ok_or_else(|| WorkError::InvalidConfig("an executor is required".into()))?;
        let config = self.config.unwrap_or_default();
        let tm = self
            .tm
            .unwrap_or_else(|| Arc::new(LocalTransactionManager));
        WorkManager::new(config, executor, tm)
    }
}
