//! Deadline scheduler
//!
//! A stateless sweep over every deal in a time-boxed state and every
//! execution still in flight. The clock reading is an explicit input and all
//! writes go through the engine's compare-and-swap transition API, so
//! overlapping or re-run sweeps are no-ops on anything already transitioned.
//! The periodic trigger is plumbing in `main.rs`; everything here is a plain
//! function of (engine, now).

use crate::deal::{DealEngine, DealStatus};
use crate::execution::ExecutionStatus;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

enum ExecutionSweep {
    Retried {
        attempted: bool,
        failed_permanently: bool,
    },
    Polled,
    Errored,
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub approvals_elapsed: u32,
    pub disputes_cancelled: u32,
    pub releases_progressed: u32,
    pub executions_polled: u32,
    pub executions_retried: u32,
    pub executions_failed_permanently: u32,
    pub errors: u32,
}

/// Run one sweep at the given instant
pub async fn run_sweep(engine: &DealEngine, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();
    crate::metrics::record_sweep_run();
    let store = engine.store();

    // Approval windows
    match store.deals_in_status(&[DealStatus::InApproval]).await {
        Ok(deals) => {
            for deal in deals {
                match engine.elapse_approval(deal.id, now).await {
                    Ok(true) => {
                        report.approvals_elapsed += 1;
                        crate::metrics::record_sweep_action("approval_elapsed");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Sweep: approval elapse for deal {} failed: {}", deal.id, e);
                        report.errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!("Sweep: listing IN_APPROVAL deals failed: {}", e);
            report.errors += 1;
        }
    }

    // Dispute windows
    match store.deals_in_status(&[DealStatus::InDispute]).await {
        Ok(deals) => {
            for deal in deals {
                match engine.elapse_dispute(deal.id, now).await {
                    Ok(true) => {
                        report.disputes_cancelled += 1;
                        crate::metrics::record_sweep_action("dispute_cancelled");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Sweep: dispute elapse for deal {} failed: {}", deal.id, e);
                        report.errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!("Sweep: listing IN_DISPUTE deals failed: {}", e);
            report.errors += 1;
        }
    }

    // Release steps that stalled (e.g. ledger unavailable on a prior attempt)
    match store
        .deals_in_status(&[DealStatus::AwaitingReleaseExecution])
        .await
    {
        Ok(deals) => {
            for deal in deals {
                match engine.continue_release(deal.id).await {
                    Ok(true) => {
                        report.releases_progressed += 1;
                        crate::metrics::record_sweep_action("release_progressed");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Sweep: release step for deal {} failed: {}", deal.id, e);
                        report.errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!("Sweep: listing release deals failed: {}", e);
            report.errors += 1;
        }
    }

    // In-flight executions: poll for progress, retry the stuck and the
    // retry-scheduled, surface permanent failures. Deals are independent, so
    // their executions are swept concurrently.
    let stuck_multiplier = engine.policy().stuck_timeout_multiplier;
    match store.executions_in_flight().await {
        Ok(executions) => {
            let sweeps = executions.into_iter().map(|execution| async move {
                let needs_retry =
                    execution.next_retry_at.is_some() || execution.is_stuck(now, stuck_multiplier);

                if needs_retry {
                    match engine.retry_execution(execution.id, now).await {
                        Ok(after) => ExecutionSweep::Retried {
                            attempted: after.retry_count > execution.retry_count,
                            failed_permanently: after.status == ExecutionStatus::Failed
                                && after.next_retry_at.is_none(),
                        },
                        Err(e) => {
                            warn!("Sweep: retry of execution {} failed: {}", execution.id, e);
                            ExecutionSweep::Errored
                        }
                    }
                } else {
                    match engine.poll_execution(execution.deal_id).await {
                        Ok(_) => ExecutionSweep::Polled,
                        Err(e) => {
                            warn!("Sweep: poll of execution {} failed: {}", execution.id, e);
                            ExecutionSweep::Errored
                        }
                    }
                }
            });

            for outcome in futures::future::join_all(sweeps).await {
                match outcome {
                    ExecutionSweep::Retried {
                        attempted,
                        failed_permanently,
                    } => {
                        if attempted {
                            report.executions_retried += 1;
                            crate::metrics::record_sweep_action("execution_retried");
                        }
                        if failed_permanently {
                            report.executions_failed_permanently += 1;
                            crate::metrics::record_sweep_action("execution_failed");
                        }
                    }
                    ExecutionSweep::Polled => report.executions_polled += 1,
                    ExecutionSweep::Errored => report.errors += 1,
                }
            }
        }
        Err(e) => {
            warn!("Sweep: listing in-flight executions failed: {}", e);
            report.errors += 1;
        }
    }

    debug!(
        "Sweep done: {} approvals elapsed, {} disputes cancelled, {} releases progressed, \
         {} polled, {} retried, {} failed permanently, {} errors",
        report.approvals_elapsed,
        report.disputes_cancelled,
        report.releases_progressed,
        report.executions_polled,
        report.executions_retried,
        report.executions_failed_permanently,
        report.errors
    );

    report
}
