//! Explicit transaction/unit-of-work objects.
//!
//! The engine never assumes a thread-local ambient transaction. Callers pass
//! a [`Transaction`] explicitly (schedule-after-commit), and each execution
//! gets its own transaction from the injected [`TransactionManager`]. The
//! default manager produces local unit-of-work objects that track status and
//! run on-commit callbacks; embedding applications provide their own manager
//! to bind real transaction boundaries.

use std::sync::Arc;

use parking_lot::Mutex;

/// Status of a transaction/unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Open; operations and on-commit registrations are accepted.
    Active,
    /// Poisoned; commit resolves to rollback.
    MarkedRollback,
    /// Committed; on-commit callbacks have run.
    Committed,
    /// Rolled back; on-commit callbacks were discarded.
    RolledBack,
}

type CommitHook = Box<dyn FnOnce() + Send>;

struct TxState {
    status: TxStatus,
    on_commit: Vec<CommitHook>,
}

/// A unit of work with an on-success callback list.
///
/// Whoever owns the commit decides when [`Transaction::commit`] runs; the
/// scheduling engine only registers callbacks and reads status.
pub struct Transaction {
    state: Mutex<TxState>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Begin a new active transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                on_commit: Vec::new(),
            }),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TxStatus {
        self.state.lock().status
    }

    /// Register a callback to run if and when this transaction commits.
    /// Returns `false` (and drops the callback) unless the transaction is
    /// still active.
    pub fn on_commit(&self, hook: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.state.lock();
        if state.status != TxStatus::Active {
            return false;
        }
        state.on_commit.push(Box::new(hook));
        true
    }

    /// Poison the transaction so that commit resolves to rollback.
    pub fn mark_rollback_only(&self) {
        let mut state = self.state.lock();
        if state.status == TxStatus::Active {
            state.status = TxStatus::MarkedRollback;
        }
    }

    /// Commit-or-rollback: commits when active (running the callback list),
    /// resolves to rollback when marked rollback-only. Returns whether the
    /// transaction actually committed.
    pub fn commit(&self) -> bool {
        let hooks = {
            let mut state = self.state.lock();
            match state.status {
                TxStatus::Active => {
                    state.status = TxStatus::Committed;
                    std::mem::take(&mut state.on_commit)
                }
                TxStatus::MarkedRollback => {
                    state.status = TxStatus::RolledBack;
                    state.on_commit.clear();
                    return false;
                }
                TxStatus::Committed => return true,
                TxStatus::RolledBack => return false,
            }
        };
        // Callbacks run outside the lock; they may schedule more work.
        for hook in hooks {
            hook();
        }
        true
    }

    /// Roll back, discarding on-commit callbacks.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        if matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) {
            state.status = TxStatus::RolledBack;
            state.on_commit.clear();
        }
    }
}

/// Strategy for opening transaction boundaries around work execution.
pub trait TransactionManager: Send + Sync + 'static {
    /// Begin a transaction for one execution attempt.
    fn begin(&self) -> Arc<Transaction>;
}

/// Default manager producing local in-process unit-of-work objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransactionManager;

impl TransactionManager for LocalTransactionManager {
    fn begin(&self) -> Arc<Transaction> {
        Arc::new(Transaction::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_commit_runs_hooks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let txn = Transaction::new();
        let f = Arc::clone(&fired);
        assert!(txn.on_commit(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(txn.commit());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(txn.status(), TxStatus::Committed);
    }

    #[test]
    fn test_rollback_discards_hooks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let txn = Transaction::new();
        let f = Arc::clone(&fired);
        txn.on_commit(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        txn.rollback();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(txn.status(), TxStatus::RolledBack);
    }

    #[test]
    fn test_marked_rollback_commit_resolves_to_rollback() {
        let txn = Transaction::new();
        txn.mark_rollback_only();
        assert!(!txn.commit());
        assert_eq!(txn.status(), TxStatus::RolledBack);
    }

    #[test]
    fn test_on_commit_rejected_after_close() {
        let txn = Transaction::new();
        txn.commit();
        assert!(!txn.on_commit(|| {}));
    }

    #[test]
    fn test_commit_idempotent() {
        let txn = Transaction::new();
        assert!(txn.commit());
        assert!(txn.commit());
    }
}
