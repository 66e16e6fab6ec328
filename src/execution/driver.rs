//! Execution driver: initiates a committed route, monitors it through the
//! provider, and applies retry with exponential backoff under a bounded
//! retry count.
//!
//! Status is only ever advanced by an explicit CAS write against the
//! persisted record, so an abandoned in-flight call never corrupts state and
//! a restarted process resumes from what the store says.

use crate::config::PolicyConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::execution::{Execution, ExecutionPurpose, ExecutionStatus};
use crate::routing::{ProviderState, RouteProvider, RouteQuote};
use crate::store::OrchestratorStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ExecutionDriver {
    store: Arc<dyn OrchestratorStore>,
    provider: Arc<dyn RouteProvider>,
    policy: PolicyConfig,
    /// Bound on any single provider call
    call_timeout: Duration,
}

impl ExecutionDriver {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        provider: Arc<dyn RouteProvider>,
        policy: PolicyConfig,
        call_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            provider,
            policy,
            call_timeout: Duration::from_secs(call_timeout_secs),
        }
    }

    /// Begin driving a route. Estimate-only quotes are rejected before any
    /// record is created.
    pub async fn start(
        &self,
        deal_id: Uuid,
        quote: &RouteQuote,
        purpose: ExecutionPurpose,
    ) -> EscrowResult<Execution> {
        let route = match quote {
            RouteQuote::Live(route) => route,
            RouteQuote::EstimateOnly(_) => {
                return Err(EscrowError::ExecutionRejected {
                    reason: "route is an estimate-only placeholder".to_string(),
                })
            }
        };

        let mut execution = Execution::new(
            deal_id,
            route.id,
            purpose,
            route.estimated_duration_secs,
        );
        self.store.insert_execution(&execution).await?;

        info!(
            "Starting execution {} for deal {} via {}",
            execution.id, deal_id, route.provider
        );

        match self.call_begin(route).await {
            Ok(handle) => {
                let now = Utc::now();
                execution.provider_handle = Some(handle);
                execution.status = ExecutionStatus::InProgress;
                execution.funds_committed = true;
                execution.push_status(ExecutionStatus::InProgress, now, "first step submitted");
                crate::metrics::record_execution_started(self.provider.name());
            }
            Err(e) if e.is_retryable() => {
                // Leave STARTED; the scheduler retries once the backoff lapses
                warn!("Transient error starting execution {}: {}", execution.id, e);
                execution.next_retry_at = Some(Utc::now() + self.backoff(0));
            }
            Err(e) => {
                warn!("Execution {} rejected by provider: {}", execution.id, e);
                execution.status = ExecutionStatus::Failed;
                execution.push_status(ExecutionStatus::Failed, Utc::now(), e.to_string());
                crate::metrics::record_execution_failed(self.provider.name());
            }
        }

        self.store.update_execution(&mut execution).await?;
        Ok(execution)
    }

    /// Poll the provider for progress. Idempotent; a transient provider
    /// error returns the last persisted status instead of failing the
    /// caller. Status severity never decreases.
    pub async fn poll(&self, execution_id: Uuid) -> EscrowResult<Execution> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EscrowError::ExecutionNotFound { execution_id })?;

        if execution.status.is_terminal() {
            return Ok(execution);
        }

        let handle = match &execution.provider_handle {
            Some(h) => h.clone(),
            // begin has not landed yet; nothing to poll
            None => return Ok(execution),
        };

        let status = match self.call_status(&handle).await {
            Ok(status) => status,
            Err(e) => {
                debug!(
                    "Poll for execution {} failed ({}), keeping last known status",
                    execution.id, e
                );
                return Ok(execution);
            }
        };

        let now = Utc::now();
        let next = match status.state {
            ProviderState::Pending => None,
            ProviderState::InProgress => Some(ExecutionStatus::InProgress),
            ProviderState::Done => Some(ExecutionStatus::Done),
            ProviderState::Failed { .. } => Some(ExecutionStatus::Failed),
        };

        let Some(next) = next else {
            return Ok(execution);
        };

        // Monotonically non-decreasing severity
        if next.severity() < execution.status.severity() {
            debug!(
                "Ignoring status downgrade {} -> {} on execution {}",
                execution.status, next, execution.id
            );
            return Ok(execution);
        }

        let changed = next != execution.status;
        execution.status = next;
        execution.push_status(next, now, status.detail.clone());
        if matches!(next, ExecutionStatus::InProgress | ExecutionStatus::Done) {
            execution.funds_committed = true;
        }

        if next == ExecutionStatus::Failed {
            let retryable = matches!(status.state, ProviderState::Failed { retryable: true });
            if retryable && execution.retry_count < self.policy.max_execution_retries {
                execution.next_retry_at = Some(now + self.backoff(execution.retry_count));
            } else {
                execution.next_retry_at = None;
            }
            crate::metrics::record_execution_failed(self.provider.name());
        } else if next == ExecutionStatus::Done {
            execution.next_retry_at = None;
            let elapsed = (now - execution.started_at).num_seconds().max(0) as f64;
            crate::metrics::record_execution_latency(self.provider.name(), elapsed);
        }

        if changed {
            info!("Execution {} is now {}", execution.id, execution.status);
        }

        match self.store.update_execution(&mut execution).await {
            Ok(()) => Ok(execution),
            // A concurrent poll won the write; its result is equivalent
            Err(EscrowError::WriteConflict { .. }) => self
                .store
                .get_execution(execution_id)
                .await?
                .ok_or(EscrowError::ExecutionNotFound { execution_id }),
            Err(e) => Err(e),
        }
    }

    /// Retry a failed or stuck execution, bounded by the configured retry
    /// count. Exhaustion latches FAILED permanently; no funds-moving call is
    /// made past the bound.
    pub async fn cancel_or_retry(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> EscrowResult<Execution> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EscrowError::ExecutionNotFound { execution_id })?;

        if execution.status == ExecutionStatus::Done {
            return Ok(execution);
        }
        if execution.status == ExecutionStatus::Failed && execution.next_retry_at.is_none() {
            // Permanently failed; only an explicit operator action moves funds now
            let reason = execution
                .status_history
                .last()
                .map(|u| u.detail.clone())
                .unwrap_or_else(|| "permanently failed".to_string());
            return Err(EscrowError::ExecutionFailed {
                execution_id: execution.id,
                reason,
            });
        }

        let stuck = execution.is_stuck(now, self.policy.stuck_timeout_multiplier);
        let failed = execution.status == ExecutionStatus::Failed;
        if !stuck && !failed && execution.next_retry_at.is_none() {
            return Ok(execution);
        }

        if execution.retry_count >= self.policy.max_execution_retries {
            warn!(
                "Execution {} exhausted {} retries, failing permanently",
                execution.id, execution.retry_count
            );
            execution.status = ExecutionStatus::Failed;
            execution.next_retry_at = None;
            execution.push_status(ExecutionStatus::Failed, now, "retry budget exhausted");
            crate::metrics::record_execution_failed(self.provider.name());
            self.store.update_execution(&mut execution).await?;
            return Ok(execution);
        }

        let due = execution.next_retry_at.map_or(true, |t| now >= t);
        if !due {
            return Ok(execution);
        }

        // Same route, fresh attempt
        let deal = self
            .store
            .get_deal(execution.deal_id)
            .await?
            .ok_or(EscrowError::DealNotFound {
                deal_id: execution.deal_id,
            })?;
        let route = deal
            .selected_route
            .as_ref()
            .filter(|r| r.id == execution.route_id)
            .ok_or_else(|| EscrowError::Internal(format!(
                "route {} no longer committed to deal {}",
                execution.route_id, execution.deal_id
            )))?;

        execution.retry_count += 1;
        match self.call_begin(route).await {
            Ok(handle) => {
                info!(
                    "Execution {} retry attempt {} started",
                    execution.id, execution.retry_count
                );
                execution.provider_handle = Some(handle);
                execution.status = ExecutionStatus::InProgress;
                execution.funds_committed = true;
                execution.started_at = now;
                execution.next_retry_at = None;
                execution.push_status(
                    ExecutionStatus::InProgress,
                    now,
                    format!("retry attempt {}", execution.retry_count),
                );
                crate::metrics::record_execution_retry(self.provider.name());
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Retry attempt {} for execution {} hit transient error: {}",
                    execution.retry_count, execution.id, e
                );
                execution.next_retry_at = Some(now + self.backoff(execution.retry_count));
            }
            Err(e) => {
                warn!(
                    "Retry attempt {} for execution {} rejected: {}",
                    execution.retry_count, execution.id, e
                );
                execution.status = ExecutionStatus::Failed;
                execution.next_retry_at = None;
                execution.push_status(ExecutionStatus::Failed, now, e.to_string());
                crate::metrics::record_execution_failed(self.provider.name());
            }
        }

        self.store.update_execution(&mut execution).await?;
        Ok(execution)
    }

    fn backoff(&self, attempt: u32) -> ChronoDuration {
        let exp = 2i64.saturating_pow(attempt.min(16));
        ChronoDuration::seconds(self.policy.retry_base_delay_secs.saturating_mul(exp))
    }

    async fn call_begin(&self, route: &crate::routing::Route) -> EscrowResult<String> {
        timeout(self.call_timeout, self.provider.begin_execution(route))
            .await
            .map_err(|_| EscrowError::Timeout {
                operation: "execution start".to_string(),
            })?
    }

    async fn call_status(&self, handle: &str) -> EscrowResult<crate::routing::ProviderStatus> {
        timeout(self.call_timeout, self.provider.execution_status(handle))
            .await
            .map_err(|_| EscrowError::Timeout {
                operation: "execution poll".to_string(),
            })?
    }
}
