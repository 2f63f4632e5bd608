//! Transactional retry loop around a single work execution.
//!
//! Every execution runs inside a transaction boundary. Concurrency conflicts
//! roll back and retry against the unit's budget; cancellation and unhandled
//! failures roll back once; success commits (including partial state saved
//! before an acknowledged suspension). The executor's cleanup hook runs
//! exactly once whatever happens.

use std::time::Instant;

use tracing::{debug, error};

use super::executor::{ExecError, WorkExecutor, WorkOutcome};
use super::transaction::TransactionManager;
use super::work::{Work, WorkContext};

/// Run one unit through the transactional retry loop and return the terminal
/// outcome. Failures inside the unit's logic never propagate past this
/// function; they become the returned outcome plus logs.
pub async fn run_in_transaction(
    executor: &dyn WorkExecutor,
    tm: &dyn TransactionManager,
    work: &Work,
    ctx: &WorkContext,
) -> WorkOutcome {
    let started = Instant::now();
    let budget = work.retry_budget;
    let mut suppressed: Vec<String> = Vec::new();
    let mut attempt: u32 = 0;

    let outcome = loop {
        let txn = tm.begin();
        match executor.execute(work, ctx).await {
            Ok(()) => {
                // Commits even when the unit suspended mid-run: whatever
                // partial state it explicitly saved before acknowledging is
                // kept for the replay.
                txn.commit();
                if ctx.was_suspended() {
                    debug!(work_id = %work.id, "work suspended itself, partial state committed");
                    break WorkOutcome::Suspended;
                }
                break WorkOutcome::Completed;
            }
            Err(ExecError::Conflict(reason)) => {
                txn.rollback();
                if attempt < budget {
                    attempt += 1;
                    debug!(
                        work_id = %work.id,
                        attempt,
                        budget,
                        %reason,
                        "concurrency conflict, retrying"
                    );
                    suppressed.push(reason);
                    continue;
                }
                error!(
                    work_id = %work.id,
                    category = %work.category,
                    attempts = attempt + 1,
                    suppressed = ?suppressed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "work failed: conflict retry budget exhausted: {reason}"
                );
                break WorkOutcome::Failed;
            }
            Err(ExecError::Canceled) => {
                txn.mark_rollback_only();
                txn.commit();
                debug!(work_id = %work.id, "work canceled cooperatively");
                break WorkOutcome::Canceled;
            }
            Err(ExecError::Failed(err)) => {
                txn.mark_rollback_only();
                txn.commit();
                error!(
                    work_id = %work.id,
                    category = %work.category,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "work failed: {err:#}"
                );
                break WorkOutcome::Failed;
            }
        }
    };

    executor.cleanup(work, outcome).await;
    outcome
}
