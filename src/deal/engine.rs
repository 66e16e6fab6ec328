//! Deal state machine
//!
//! Central per-deal lifecycle controller. Every mutating operation follows
//! the same discipline: load the persisted record, validate the requested
//! transition against the current status, mutate in memory, then write back
//! with a compare-and-swap on the record version. A concurrent writer loses
//! with `WriteConflict` and must re-fetch; an illegal transition fails with
//! `StateConflict` naming current and requested state. Neither is retried
//! automatically.

use crate::config::{PolicyConfig, RoutingConfig, ScoringWeights};
use crate::deal::{
    Condition, ConditionKind, Deal, DealStatus, EventKind, Party, RouteAttempt,
};
use crate::error::{EscrowError, EscrowResult};
use crate::execution::{Execution, ExecutionDriver, ExecutionPurpose, ExecutionStatus};
use crate::ledger::EscrowLedger;
use crate::network::{AssetRef, NetworkRegistry};
use crate::routing::{selector, RouteAggregator, RouteProvider, RouteRequest};
use crate::store::OrchestratorStore;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inputs for deal creation
#[derive(Debug, Clone, Deserialize)]
pub struct NewDeal {
    pub buyer: Party,
    pub seller: Party,
    pub amount: Decimal,
    pub asset: Option<AssetRef>,
    #[serde(default)]
    pub conditions: Vec<NewCondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCondition {
    pub kind: ConditionKind,
    pub description: String,
}

/// How a dispute was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    Release,
    Refund,
}

pub struct DealEngine {
    store: Arc<dyn OrchestratorStore>,
    ledger: Arc<dyn EscrowLedger>,
    aggregator: RouteAggregator,
    driver: ExecutionDriver,
    registry: NetworkRegistry,
    weights: ScoringWeights,
    policy: PolicyConfig,
}

impl DealEngine {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        ledger: Arc<dyn EscrowLedger>,
        provider: Arc<dyn RouteProvider>,
        routing: RoutingConfig,
        policy: PolicyConfig,
    ) -> Self {
        let aggregator = RouteAggregator::new(provider.clone(), &routing);
        let driver = ExecutionDriver::new(
            store.clone(),
            provider,
            policy.clone(),
            routing.request_timeout_secs,
        );

        Self {
            store,
            ledger,
            aggregator,
            driver,
            registry: NetworkRegistry::builtin(),
            weights: routing.weights,
            policy,
        }
    }

    pub fn store(&self) -> Arc<dyn OrchestratorStore> {
        self.store.clone()
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Create a deal awaiting counterparty acceptance
    pub async fn create_deal(&self, request: NewDeal) -> EscrowResult<Deal> {
        if request.amount <= Decimal::ZERO {
            return Err(EscrowError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        if request.buyer.address.trim().is_empty() || request.seller.address.trim().is_empty() {
            return Err(EscrowError::Validation(
                "both parties need an address".to_string(),
            ));
        }
        if request.buyer == request.seller {
            return Err(EscrowError::Validation(
                "buyer and seller must differ".to_string(),
            ));
        }

        let transfer_kind = self.registry.classify(
            &request.buyer.network,
            &request.seller.network,
            request.asset.as_ref(),
        )?;

        let now = Utc::now();
        let mut deal = Deal {
            id: Uuid::new_v4(),
            version: 0,
            status: DealStatus::AwaitingOtherParty,
            buyer: request.buyer,
            seller: request.seller,
            amount: request.amount,
            asset: request.asset,
            transfer_kind,
            selected_route: None,
            route_attempts: Vec::new(),
            execution_id: None,
            conditions: request
                .conditions
                .into_iter()
                .map(|c| Condition::new(c.kind, c.description))
                .collect(),
            timeline: Vec::new(),
            awaiting_manual_route: false,
            needs_manual_review: false,
            approval_deadline: None,
            dispute_deadline: None,
            created_at: now,
            updated_at: now,
        };
        deal.record_event(
            EventKind::Created,
            format!("deal created ({})", transfer_kind.as_str()),
        );

        self.store.insert_deal(&deal).await?;
        crate::metrics::record_deal_created(transfer_kind.as_str());
        info!("Deal {} created ({})", deal.id, transfer_kind.as_str());

        Ok(deal)
    }

    /// Counterparty acceptance; branches into the deposit-awaiting state per
    /// the cached transfer classification
    pub async fn accept_deal(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        if deal.transfer_kind.is_cross_chain() {
            self.transition(
                &mut deal,
                DealStatus::AwaitingCrossChainDeposit,
                EventKind::Accepted,
                "counterparty accepted; awaiting cross-chain deposit".to_string(),
            )?;

            deal.conditions.push(Condition::new(
                ConditionKind::NetworkCompatibility,
                format!(
                    "bridgeable path from {} to {}",
                    deal.buyer.network, deal.seller.network
                ),
            ));

            self.commit_route(&mut deal, ExecutionPurpose::Deposit).await?;
        } else {
            self.transition(
                &mut deal,
                DealStatus::AwaitingDeposit,
                EventKind::Accepted,
                "counterparty accepted; awaiting deposit".to_string(),
            )?;

            let receipt = self.ledger.deposit(deal.id, deal.amount).await?;
            deal.record_event(
                EventKind::DepositRequested,
                format!("escrow deposit requested ({})", receipt.reference),
            );
        }

        self.store.update_deal(&mut deal).await?;
        Ok(deal)
    }

    /// Confirmed deposit from the escrow ledger. Duplicate confirmations are
    /// no-ops: the ledger is an eventually-consistent event source and will
    /// redeliver.
    pub async fn record_deposit(&self, deal_id: Uuid, proof: &str) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        match deal.status {
            DealStatus::AwaitingDeposit | DealStatus::AwaitingCrossChainDeposit => {
                self.apply_deposit_confirmed(
                    &mut deal,
                    format!("deposit confirmed ({})", proof),
                )?;
                self.store.update_deal(&mut deal).await?;
                Ok(deal)
            }
            DealStatus::AwaitingFulfillment
            | DealStatus::ReadyForApproval
            | DealStatus::InApproval
            | DealStatus::InDispute
            | DealStatus::AwaitingReleaseExecution
            | DealStatus::Completed => {
                debug!("Duplicate deposit confirmation for deal {}", deal.id);
                Ok(deal)
            }
            _ => Err(EscrowError::StateConflict {
                deal_id: deal.id,
                current: deal.status.to_string(),
                requested: DealStatus::AwaitingFulfillment.to_string(),
            }),
        }
    }

    /// Mark a condition fulfilled. Re-marking a fulfilled condition is a
    /// no-op; fulfilling the last one advances the deal to READY_FOR_APPROVAL.
    pub async fn fulfill_condition(
        &self,
        deal_id: Uuid,
        condition_id: Uuid,
    ) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        if !deal.status.tracks_conditions() {
            return Err(EscrowError::Validation(format!(
                "deal {} is {}, conditions can no longer be updated",
                deal.id, deal.status
            )));
        }

        let description = {
            let condition = deal.condition_mut(condition_id).ok_or(
                EscrowError::ConditionNotFound {
                    deal_id,
                    condition_id,
                },
            )?;
            if condition.fulfilled {
                return Ok(deal);
            }
            condition.fulfilled = true;
            condition.fulfilled_at = Some(Utc::now());
            condition.description.clone()
        };
        deal.record_event(EventKind::ConditionFulfilled, description);

        if deal.status == DealStatus::AwaitingFulfillment && deal.all_conditions_fulfilled() {
            self.transition(
                &mut deal,
                DealStatus::ReadyForApproval,
                EventKind::ReadyForApproval,
                "all conditions fulfilled".to_string(),
            )?;
        }

        self.store.update_deal(&mut deal).await?;
        Ok(deal)
    }

    /// Open the approval window
    pub async fn start_approval(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        let deadline = Utc::now() + Duration::seconds(self.policy.approval_window_secs);
        self.transition(
            &mut deal,
            DealStatus::InApproval,
            EventKind::ApprovalStarted,
            format!("approval window open until {}", deadline.to_rfc3339()),
        )?;
        deal.approval_deadline = Some(deadline);

        self.store.update_deal(&mut deal).await?;
        Ok(deal)
    }

    /// Explicit buyer confirmation during the approval window
    pub async fn approve_release(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;
        self.begin_release(
            &mut deal,
            EventKind::ApprovalConfirmed,
            "buyer confirmed release".to_string(),
        )
        .await?;
        Ok(deal)
    }

    /// Raise a dispute during the approval window
    pub async fn raise_dispute(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        let deadline = Utc::now() + Duration::seconds(self.policy.dispute_window_secs);
        self.transition(
            &mut deal,
            DealStatus::InDispute,
            EventKind::DisputeRaised,
            format!("dispute raised, open until {}", deadline.to_rfc3339()),
        )?;
        deal.dispute_deadline = Some(deadline);

        self.store.update_deal(&mut deal).await?;
        Ok(deal)
    }

    /// Explicit dispute resolution
    pub async fn resolve_dispute(
        &self,
        deal_id: Uuid,
        outcome: DisputeOutcome,
    ) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        match outcome {
            DisputeOutcome::Release => {
                self.begin_release(
                    &mut deal,
                    EventKind::DisputeResolved,
                    "dispute resolved in favor of release".to_string(),
                )
                .await?;
            }
            DisputeOutcome::Refund => {
                self.cancel_with_refund(
                    &mut deal,
                    EventKind::DisputeResolved,
                    "dispute resolved in favor of refund".to_string(),
                )
                .await?;
            }
        }

        Ok(deal)
    }

    /// Explicit cancellation, permitted while funds are not locked
    pub async fn cancel_deal(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        if !deal.status.is_pre_deposit() {
            return Err(EscrowError::StateConflict {
                deal_id: deal.id,
                current: deal.status.to_string(),
                requested: DealStatus::Cancelled.to_string(),
            });
        }

        // A deposit-side execution may already have funds in motion
        if let Some(execution_id) = deal.execution_id {
            if let Some(execution) = self.store.get_execution(execution_id).await? {
                if execution.funds_committed && !execution.status.is_terminal() {
                    self.flag_manual_review(
                        &mut deal,
                        "cancelled while a deposit-side execution was in flight",
                    );
                }
            }
        }

        self.transition(
            &mut deal,
            DealStatus::Cancelled,
            EventKind::Cancelled,
            "deal cancelled before funds were locked".to_string(),
        )?;

        self.store.update_deal(&mut deal).await?;
        Ok(deal)
    }

    /// Read-only projection
    pub async fn get_deal(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        self.load(deal_id).await
    }

    /// Drive the deal's in-flight execution one poll step and apply any
    /// resulting deal transition. Idempotent: repeated calls with no
    /// provider-side change leave the deal untouched.
    pub async fn poll_execution(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        let mut deal = self.load(deal_id).await?;

        let Some(execution_id) = deal.execution_id else {
            return Ok(deal);
        };
        let before = self.store.get_execution(execution_id).await?.ok_or(
            EscrowError::ExecutionNotFound { execution_id },
        )?;

        let execution = self.driver.poll(execution_id).await?;

        let mut dirty = false;
        if execution.status != before.status {
            deal.record_event(
                EventKind::ExecutionStatus,
                format!(
                    "{} execution now {}",
                    purpose_str(execution.purpose),
                    execution.status
                ),
            );
            dirty = true;
        }

        dirty |= self.apply_execution_outcome(&mut deal, &execution)?;

        if dirty {
            self.store.update_deal(&mut deal).await?;
        }
        Ok(deal)
    }

    /// Retry or permanently fail a stuck/failed execution, flagging the
    /// owning deal for manual review on exhaustion
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> EscrowResult<Execution> {
        let execution = self.driver.cancel_or_retry(execution_id, now).await?;

        if execution.status == ExecutionStatus::Failed && execution.next_retry_at.is_none() {
            if let Some(mut deal) = self.store.get_deal(execution.deal_id).await? {
                if self.apply_execution_outcome(&mut deal, &execution)? {
                    self.store.update_deal(&mut deal).await?;
                }
            }
        }

        Ok(execution)
    }

    /// Fire IN_APPROVAL -> AWAITING_RELEASE_EXECUTION when the approval
    /// window has elapsed without a dispute. No-op unless both hold.
    pub async fn elapse_approval(&self, deal_id: Uuid, now: DateTime<Utc>) -> EscrowResult<bool> {
        let mut deal = self.load(deal_id).await?;

        if deal.status != DealStatus::InApproval {
            return Ok(false);
        }
        match deal.approval_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Ok(false),
        }

        self.begin_release(
            &mut deal,
            EventKind::ApprovalElapsed,
            "approval window elapsed without dispute".to_string(),
        )
        .await?;
        Ok(true)
    }

    /// Fire IN_DISPUTE -> CANCELLED with a refund request when the dispute
    /// window has elapsed without resolution. No-op unless both hold.
    pub async fn elapse_dispute(&self, deal_id: Uuid, now: DateTime<Utc>) -> EscrowResult<bool> {
        let mut deal = self.load(deal_id).await?;

        if deal.status != DealStatus::InDispute {
            return Ok(false);
        }
        match deal.dispute_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Ok(false),
        }

        self.cancel_with_refund(
            &mut deal,
            EventKind::DisputeElapsed,
            "dispute window elapsed without resolution".to_string(),
        )
        .await?;
        Ok(true)
    }

    /// Push a deal sitting in AWAITING_RELEASE_EXECUTION forward: start the
    /// release step when none is running. Returns whether anything was done.
    pub async fn continue_release(&self, deal_id: Uuid) -> EscrowResult<bool> {
        let mut deal = self.load(deal_id).await?;

        if deal.status != DealStatus::AwaitingReleaseExecution {
            return Ok(false);
        }
        if deal.awaiting_manual_route || deal.needs_manual_review {
            return Ok(false);
        }

        if deal.transfer_kind.is_cross_chain() {
            if let Some(execution_id) = deal.execution_id {
                if let Some(execution) = self.store.get_execution(execution_id).await? {
                    if execution.purpose == ExecutionPurpose::Release
                        && !(execution.status == ExecutionStatus::Failed
                            && execution.next_retry_at.is_none())
                    {
                        // Release execution already running; polling owns it
                        return Ok(false);
                    }
                }
            }
        }

        self.start_release(&mut deal).await?;
        Ok(true)
    }

    // ---- internal helpers ----

    async fn load(&self, deal_id: Uuid) -> EscrowResult<Deal> {
        self.store
            .get_deal(deal_id)
            .await?
            .ok_or(EscrowError::DealNotFound { deal_id })
    }

    fn ensure_transition(&self, deal: &Deal, to: DealStatus) -> EscrowResult<()> {
        if deal.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(EscrowError::StateConflict {
                deal_id: deal.id,
                current: deal.status.to_string(),
                requested: to.to_string(),
            })
        }
    }

    fn transition(
        &self,
        deal: &mut Deal,
        to: DealStatus,
        kind: EventKind,
        detail: String,
    ) -> EscrowResult<()> {
        self.ensure_transition(deal, to)?;
        debug!("Deal {}: {} -> {}", deal.id, deal.status, to);
        deal.status = to;
        deal.record_event(kind, detail);
        crate::metrics::record_deal_transition(to.as_str());
        Ok(())
    }

    fn flag_manual_review(&self, deal: &mut Deal, detail: &str) {
        if deal.needs_manual_review {
            return;
        }
        warn!("Deal {} flagged for manual review: {}", deal.id, detail);
        deal.needs_manual_review = true;
        deal.record_event(EventKind::ManualReviewFlagged, detail.to_string());
        crate::metrics::record_manual_review_flag();
    }

    /// Deposit confirmation side effects shared by ledger proofs and
    /// deposit-side execution completion
    fn apply_deposit_confirmed(&self, deal: &mut Deal, detail: String) -> EscrowResult<()> {
        if deal.is_cross_chain() {
            let fulfilled = deal
                .conditions
                .iter_mut()
                .find(|c| c.kind == ConditionKind::NetworkCompatibility && !c.fulfilled)
                .map(|c| {
                    c.fulfilled = true;
                    c.fulfilled_at = Some(Utc::now());
                    c.description.clone()
                });
            if let Some(description) = fulfilled {
                deal.record_event(EventKind::ConditionFulfilled, description);
            }
        }

        self.transition(deal, DealStatus::AwaitingFulfillment, EventKind::DepositConfirmed, detail)?;

        if deal.all_conditions_fulfilled() {
            self.transition(
                deal,
                DealStatus::ReadyForApproval,
                EventKind::ReadyForApproval,
                "all conditions fulfilled".to_string(),
            )?;
        }
        Ok(())
    }

    /// Apply deal-side consequences of an execution's current state.
    /// Idempotent: guards on the deal status make re-application a no-op.
    fn apply_execution_outcome(
        &self,
        deal: &mut Deal,
        execution: &Execution,
    ) -> EscrowResult<bool> {
        match (execution.status, execution.purpose) {
            (ExecutionStatus::Done, ExecutionPurpose::Deposit)
                if deal.status == DealStatus::AwaitingCrossChainDeposit =>
            {
                self.apply_deposit_confirmed(
                    deal,
                    "cross-chain deposit route completed".to_string(),
                )?;
                Ok(true)
            }
            (ExecutionStatus::Done, ExecutionPurpose::Release)
                if deal.status == DealStatus::AwaitingReleaseExecution =>
            {
                self.transition(
                    deal,
                    DealStatus::Completed,
                    EventKind::Completed,
                    "release route completed; escrow settled".to_string(),
                )?;
                Ok(true)
            }
            (ExecutionStatus::Failed, _)
                if execution.next_retry_at.is_none() && !deal.needs_manual_review =>
            {
                let detail = if execution.funds_committed {
                    "execution failed after funds moved; manual reconciliation required"
                } else {
                    "execution failed before any funds moved"
                };
                self.flag_manual_review(deal, detail);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Query the aggregator, select a route, and commit it to the deal.
    /// Executable routes start driving immediately; estimate-only selections
    /// park the deal for a manual route.
    async fn commit_route(
        &self,
        deal: &mut Deal,
        purpose: ExecutionPurpose,
    ) -> EscrowResult<()> {
        let request = self.route_request(deal, purpose)?;
        let quotes = self.aggregator.find_routes(&request).await?;
        let selection = selector::select_route(&quotes, &self.weights)?;

        let route = selection.quote.route().clone();
        deal.selected_route = Some(route.clone());
        deal.awaiting_manual_route = selection.awaiting_manual_route;

        let mut attempt = RouteAttempt {
            route: route.clone(),
            committed_at: Utc::now(),
            execution_id: None,
        };

        if selection.quote.is_executable() {
            let execution = self.driver.start(deal.id, &selection.quote, purpose).await?;
            attempt.execution_id = Some(execution.id);
            deal.execution_id = Some(execution.id);
            deal.record_event(
                EventKind::RouteCommitted,
                format!(
                    "{} route via {} committed ({} steps, est fee {}, est {}s)",
                    purpose_str(purpose),
                    route.provider,
                    route.steps.len(),
                    route.estimated_fee,
                    route.estimated_duration_secs
                ),
            );
        } else {
            deal.record_event(
                EventKind::AwaitingManualRoute,
                "live routing unavailable; estimate-only placeholder committed".to_string(),
            );
        }

        deal.route_attempts.push(attempt);
        Ok(())
    }

    fn route_request(
        &self,
        deal: &Deal,
        purpose: ExecutionPurpose,
    ) -> EscrowResult<RouteRequest> {
        let native = self.registry.require(&deal.buyer.network)?.native_asset.clone();
        let asset = deal.asset_symbol(&native);

        // Custody sits on the buyer's network: the deposit side normalizes
        // the buyer's funds into the deal asset under escrow, the release
        // side carries the cross-chain legs to the seller.
        Ok(match purpose {
            ExecutionPurpose::Deposit => RouteRequest {
                source_network: deal.buyer.network.clone(),
                destination_network: deal.buyer.network.clone(),
                asset,
                amount: deal.amount,
                from_address: deal.buyer.address.clone(),
                to_address: escrow_address(deal.id),
            },
            ExecutionPurpose::Release => RouteRequest {
                source_network: deal.buyer.network.clone(),
                destination_network: deal.seller.network.clone(),
                asset,
                amount: deal.amount,
                from_address: escrow_address(deal.id),
                to_address: deal.seller.address.clone(),
            },
        })
    }

    /// Commit entry into AWAITING_RELEASE_EXECUTION, then drive the release
    /// step. Two commits: the phase entry is observable even if the release
    /// step stalls and is resumed by a later sweep.
    async fn begin_release(
        &self,
        deal: &mut Deal,
        kind: EventKind,
        detail: String,
    ) -> EscrowResult<()> {
        self.transition(deal, DealStatus::AwaitingReleaseExecution, kind, detail)?;
        self.store.update_deal(deal).await?;
        self.start_release(deal).await
    }

    async fn start_release(&self, deal: &mut Deal) -> EscrowResult<()> {
        if deal.transfer_kind.is_cross_chain() {
            self.commit_route(deal, ExecutionPurpose::Release).await?;
            self.store.update_deal(deal).await?;
        } else {
            let receipt = self.ledger.release(deal.id, &deal.seller.address).await?;
            deal.record_event(
                EventKind::ReleaseRequested,
                format!("escrow release requested ({})", receipt.reference),
            );
            self.transition(
                deal,
                DealStatus::Completed,
                EventKind::Completed,
                "escrow released to seller".to_string(),
            )?;
            self.store.update_deal(deal).await?;
        }
        Ok(())
    }

    async fn cancel_with_refund(
        &self,
        deal: &mut Deal,
        kind: EventKind,
        detail: String,
    ) -> EscrowResult<()> {
        self.transition(deal, DealStatus::Cancelled, kind, detail)?;

        match self.ledger.refund(deal.id).await {
            Ok(receipt) => {
                deal.record_event(
                    EventKind::RefundRequested,
                    format!("escrow refund requested ({})", receipt.reference),
                );
            }
            Err(e) => {
                self.flag_manual_review(
                    deal,
                    &format!("refund request failed, needs operator action: {}", e),
                );
            }
        }

        self.store.update_deal(deal).await?;
        Ok(())
    }
}

fn purpose_str(purpose: ExecutionPurpose) -> &'static str {
    match purpose {
        ExecutionPurpose::Deposit => "deposit",
        ExecutionPurpose::Release => "release",
    }
}

fn escrow_address(deal_id: Uuid) -> String {
    format!("escrow:{}", deal_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::LedgerReceipt;
    use crate::routing::{ProviderState, ProviderStatus, Route, RouteStep, StepKind};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Ledger stub recording every request
    pub(crate) struct RecordingLedger {
        pub deposits: Mutex<Vec<Uuid>>,
        pub releases: Mutex<Vec<(Uuid, String)>>,
        pub refunds: Mutex<Vec<Uuid>>,
    }

    impl RecordingLedger {
        pub fn new() -> Self {
            Self {
                deposits: Mutex::new(Vec::new()),
                releases: Mutex::new(Vec::new()),
                refunds: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EscrowLedger for RecordingLedger {
        async fn deposit(&self, deal_id: Uuid, _amount: Decimal) -> EscrowResult<LedgerReceipt> {
            self.deposits.lock().unwrap().push(deal_id);
            Ok(LedgerReceipt {
                reference: format!("dep-{}", deal_id),
                accepted_at: Utc::now(),
            })
        }

        async fn release(&self, deal_id: Uuid, to: &str) -> EscrowResult<LedgerReceipt> {
            self.releases.lock().unwrap().push((deal_id, to.to_string()));
            Ok(LedgerReceipt {
                reference: format!("rel-{}", deal_id),
                accepted_at: Utc::now(),
            })
        }

        async fn refund(&self, deal_id: Uuid) -> EscrowResult<LedgerReceipt> {
            self.refunds.lock().unwrap().push(deal_id);
            Ok(LedgerReceipt {
                reference: format!("ref-{}", deal_id),
                accepted_at: Utc::now(),
            })
        }
    }

    pub(crate) enum ProviderMode {
        Live,
        Down,
        NoRoutes,
    }

    /// Route provider stub: routes built from the request, scripted
    /// execution statuses
    pub(crate) struct TestProvider {
        pub mode: Mutex<ProviderMode>,
        pub statuses: Mutex<VecDeque<ProviderStatus>>,
        pub begin_calls: AtomicUsize,
        pub route_duration_secs: u64,
    }

    impl TestProvider {
        pub fn new(mode: ProviderMode) -> Self {
            Self {
                mode: Mutex::new(mode),
                statuses: Mutex::new(VecDeque::new()),
                begin_calls: AtomicUsize::new(0),
                route_duration_secs: 600,
            }
        }

        pub fn push_status(&self, state: ProviderState, detail: &str) {
            self.statuses.lock().unwrap().push_back(ProviderStatus {
                state,
                detail: detail.to_string(),
            });
        }
    }

    #[async_trait]
    impl RouteProvider for TestProvider {
        fn name(&self) -> &str {
            "test"
        }

        async fn find_routes(&self, request: &RouteRequest) -> EscrowResult<Vec<Route>> {
            match *self.mode.lock().unwrap() {
                ProviderMode::Live => Ok(vec![Route {
                    id: Uuid::new_v4(),
                    source_network: request.source_network.clone(),
                    destination_network: request.destination_network.clone(),
                    source_asset: request.asset.clone(),
                    destination_asset: request.asset.clone(),
                    steps: vec![RouteStep {
                        kind: StepKind::Bridge,
                        provider: "hopper".to_string(),
                        source_asset: request.asset.clone(),
                        destination_asset: request.asset.clone(),
                    }],
                    estimated_fee: Decimal::new(120, 2),
                    estimated_duration_secs: self.route_duration_secs,
                    confidence_score: 0.9,
                    provider: "test".to_string(),
                }]),
                ProviderMode::Down => Err(EscrowError::ProviderUnavailable {
                    provider: "test".to_string(),
                    message: "connection refused".to_string(),
                }),
                ProviderMode::NoRoutes => Ok(Vec::new()),
            }
        }

        async fn begin_execution(&self, _route: &Route) -> EscrowResult<String> {
            let n = self.begin_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("handle-{}", n + 1))
        }

        async fn execution_status(&self, _handle: &str) -> EscrowResult<ProviderStatus> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProviderStatus {
                    state: ProviderState::InProgress,
                    detail: String::new(),
                }))
        }
    }

    pub(crate) fn routing_config() -> RoutingConfig {
        RoutingConfig {
            provider_name: "test".to_string(),
            provider_url: "http://localhost:0".to_string(),
            request_timeout_secs: 2,
            weights: ScoringWeights::default(),
            static_estimates: Vec::new(),
            default_estimate_fee: Decimal::new(5, 0),
            default_estimate_duration_secs: 1800,
        }
    }

    pub(crate) fn test_engine(
        provider: Arc<TestProvider>,
        ledger: Arc<RecordingLedger>,
        policy: PolicyConfig,
    ) -> (DealEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = DealEngine::new(
            store.clone(),
            ledger,
            provider,
            routing_config(),
            policy,
        );
        (engine, store)
    }

    pub(crate) fn same_chain_deal(conditions: usize) -> NewDeal {
        NewDeal {
            buyer: Party {
                network: "ethereum".to_string(),
                address: "0xbuyer".to_string(),
            },
            seller: Party {
                network: "ethereum".to_string(),
                address: "0xseller".to_string(),
            },
            amount: Decimal::new(25, 1),
            asset: None,
            conditions: (0..conditions)
                .map(|i| NewCondition {
                    kind: ConditionKind::Custom,
                    description: format!("condition {}", i + 1),
                })
                .collect(),
        }
    }

    pub(crate) fn cross_chain_deal() -> NewDeal {
        NewDeal {
            buyer: Party {
                network: "ethereum".to_string(),
                address: "0xbuyer".to_string(),
            },
            seller: Party {
                network: "polygon".to_string(),
                address: "0xseller".to_string(),
            },
            amount: Decimal::new(25, 1),
            asset: None,
            conditions: vec![NewCondition {
                kind: ConditionKind::Documents,
                description: "title documents reviewed".to_string(),
            }],
        }
    }

    fn kinds(deal: &Deal) -> Vec<EventKind> {
        deal.timeline.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn test_same_chain_deal_completes_after_approval_elapses() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger.clone(), PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(2)).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingOtherParty);
        assert_eq!(deal.amount, Decimal::new(25, 1));
        assert!(!deal.is_cross_chain());

        let deal = engine.accept_deal(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingDeposit);
        assert_eq!(ledger.deposits.lock().unwrap().as_slice(), &[deal.id]);

        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingFulfillment);

        let first = deal.conditions[0].id;
        let second = deal.conditions[1].id;
        let deal = engine.fulfill_condition(deal.id, first).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingFulfillment);
        let deal = engine.fulfill_condition(deal.id, second).await.unwrap();
        // Every condition fulfilled immediately before READY_FOR_APPROVAL
        assert!(deal.all_conditions_fulfilled());
        assert_eq!(deal.status, DealStatus::ReadyForApproval);

        let deal = engine.start_approval(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::InApproval);
        let deadline = deal.approval_deadline.unwrap();

        // Window elapses with no dispute
        let acted = engine
            .elapse_approval(deal.id, deadline + Duration::seconds(1))
            .await
            .unwrap();
        assert!(acted);

        let deal = engine.get_deal(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::Completed);
        assert_eq!(
            ledger.releases.lock().unwrap().as_slice(),
            &[(deal.id, "0xseller".to_string())]
        );

        // The deal passed through AWAITING_RELEASE_EXECUTION before COMPLETED
        let events = kinds(&deal);
        let elapsed_at = events
            .iter()
            .position(|k| *k == EventKind::ApprovalElapsed)
            .unwrap();
        let completed_at = events
            .iter()
            .position(|k| *k == EventKind::Completed)
            .unwrap();
        assert!(elapsed_at < completed_at);
    }

    #[tokio::test]
    async fn test_cross_chain_accept_adds_compatibility_condition() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger, PolicyConfig::default());

        let deal = engine.create_deal(cross_chain_deal()).await.unwrap();
        assert!(deal.is_cross_chain());

        let deal = engine.accept_deal(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingCrossChainDeposit);
        assert!(deal
            .conditions
            .iter()
            .any(|c| c.kind == ConditionKind::NetworkCompatibility));
        assert!(deal.selected_route.is_some());
        assert!(deal.execution_id.is_some());
        assert!(!deal.awaiting_manual_route);
        assert_eq!(deal.route_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_down_parks_deal_on_estimate() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Down));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider.clone(), ledger, PolicyConfig::default());

        let deal = engine.create_deal(cross_chain_deal()).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();

        assert_eq!(deal.status, DealStatus::AwaitingCrossChainDeposit);
        assert!(deal.awaiting_manual_route);
        let route = deal.selected_route.as_ref().unwrap();
        assert_eq!(route.confidence_score, 0.0);
        // The placeholder was never handed to the driver
        assert!(deal.execution_id.is_none());
        assert_eq!(provider.begin_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deposit_execution_done_advances_deal() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider.clone(), ledger, PolicyConfig::default());

        let deal = engine.create_deal(cross_chain_deal()).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();

        provider.push_status(ProviderState::Done, "bridged");
        let deal = engine.poll_execution(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingFulfillment);
        // The auto-added compatibility condition is fulfilled by completion
        assert!(deal
            .conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::NetworkCompatibility)
            .all(|c| c.fulfilled));

        // Re-polling a terminal execution changes nothing
        let timeline_len = deal.timeline.len();
        let deal = engine.poll_execution(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingFulfillment);
        assert_eq!(deal.timeline.len(), timeline_len);
    }

    #[tokio::test]
    async fn test_cross_chain_release_completes_via_execution() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider.clone(), ledger.clone(), PolicyConfig::default());

        let deal = engine.create_deal(cross_chain_deal()).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();
        provider.push_status(ProviderState::Done, "bridged");
        let deal = engine.poll_execution(deal.id).await.unwrap();

        let pending: Vec<Uuid> = deal
            .conditions
            .iter()
            .filter(|c| !c.fulfilled)
            .map(|c| c.id)
            .collect();
        let mut deal = deal;
        for condition_id in pending {
            deal = engine.fulfill_condition(deal.id, condition_id).await.unwrap();
        }
        assert_eq!(deal.status, DealStatus::ReadyForApproval);

        let deal = engine.start_approval(deal.id).await.unwrap();
        let deal = engine.approve_release(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingReleaseExecution);
        // Release side runs a route, not a same-chain ledger call
        assert!(ledger.releases.lock().unwrap().is_empty());
        let release_attempt = deal.route_attempts.last().unwrap();
        assert_eq!(
            release_attempt.route.destination_network,
            deal.seller.network
        );

        provider.push_status(ProviderState::Done, "released");
        let deal = engine.poll_execution(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_transitions_are_conflicts_or_noops() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger, PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(1)).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();

        // Duplicate accept conflicts and leaves state unchanged
        let err = engine.accept_deal(deal.id).await.unwrap_err();
        assert!(matches!(err, EscrowError::StateConflict { .. }));
        let unchanged = engine.get_deal(deal.id).await.unwrap();
        assert_eq!(unchanged.status, DealStatus::AwaitingDeposit);

        // Duplicate deposit confirmation is a no-op
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        let timeline_len = deal.timeline.len();
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingFulfillment);
        assert_eq!(deal.timeline.len(), timeline_len);

        // Re-marking a fulfilled condition is a no-op
        let condition_id = deal.conditions[0].id;
        let deal = engine.fulfill_condition(deal.id, condition_id).await.unwrap();
        let timeline_len = deal.timeline.len();
        let deal = engine.fulfill_condition(deal.id, condition_id).await.unwrap();
        assert_eq!(deal.timeline.len(), timeline_len);

        // Double dispute is an explicit error
        let deal = engine.start_approval(deal.id).await.unwrap();
        engine.raise_dispute(deal.id).await.unwrap();
        assert!(matches!(
            engine.raise_dispute(deal.id).await,
            Err(EscrowError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispute_timeout_cancels_and_requests_refund() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger.clone(), PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(1)).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        let condition_id = deal.conditions[0].id;
        let deal = engine.fulfill_condition(deal.id, condition_id).await.unwrap();
        let deal = engine.start_approval(deal.id).await.unwrap();
        let deal = engine.raise_dispute(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::InDispute);
        let deadline = deal.dispute_deadline.unwrap();

        // Before the deadline the sweep must not act
        let acted = engine
            .elapse_dispute(deal.id, deadline - Duration::seconds(1))
            .await
            .unwrap();
        assert!(!acted);

        let acted = engine
            .elapse_dispute(deal.id, deadline + Duration::seconds(1))
            .await
            .unwrap();
        assert!(acted);

        let deal = engine.get_deal(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::Cancelled);
        assert_eq!(ledger.refunds.lock().unwrap().as_slice(), &[deal.id]);
        assert!(kinds(&deal).contains(&EventKind::DisputeElapsed));
        assert!(kinds(&deal).contains(&EventKind::RefundRequested));

        // Re-running the elapsed sweep is a no-op
        let timeline_len = deal.timeline.len();
        let acted = engine
            .elapse_dispute(deal.id, deadline + Duration::seconds(60))
            .await
            .unwrap();
        assert!(!acted);
        let deal = engine.get_deal(deal.id).await.unwrap();
        assert_eq!(deal.timeline.len(), timeline_len);
    }

    #[tokio::test]
    async fn test_resolve_dispute_in_favor_of_release() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger.clone(), PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(0)).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();
        // Zero conditions: deposit confirmation advances straight to approval
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        assert_eq!(deal.status, DealStatus::ReadyForApproval);

        let deal = engine.start_approval(deal.id).await.unwrap();
        let deal = engine.raise_dispute(deal.id).await.unwrap();
        let deal = engine
            .resolve_dispute(deal.id, DisputeOutcome::Release)
            .await
            .unwrap();
        assert_eq!(deal.status, DealStatus::Completed);
        assert_eq!(ledger.releases.lock().unwrap().len(), 1);
        assert!(ledger.refunds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_before_funds_locked() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger, PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(1)).await.unwrap();
        let cancelled = engine.cancel_deal(deal.id).await.unwrap();
        assert_eq!(cancelled.status, DealStatus::Cancelled);

        let deal = engine.create_deal(same_chain_deal(1)).await.unwrap();
        let deal = engine.accept_deal(deal.id).await.unwrap();
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        assert!(matches!(
            engine.cancel_deal(deal.id).await,
            Err(EscrowError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_conditions_locked_outside_tracking_phases() {
        let provider = Arc::new(TestProvider::new(ProviderMode::Live));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger, PolicyConfig::default());

        let deal = engine.create_deal(same_chain_deal(1)).await.unwrap();
        let condition_id = deal.conditions[0].id;
        // AWAITING_OTHER_PARTY does not track conditions
        assert!(engine.fulfill_condition(deal.id, condition_id).await.is_err());

        let deal = engine.accept_deal(deal.id).await.unwrap();
        let deal = engine.record_deposit(deal.id, "0xproof").await.unwrap();
        let deal = engine.fulfill_condition(deal.id, condition_id).await.unwrap();
        assert_eq!(deal.status, DealStatus::ReadyForApproval);

        // READY_FOR_APPROVAL no longer tracks conditions
        assert!(engine
            .fulfill_condition(deal.id, condition_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_no_route_found_surfaces_and_deal_untouched() {
        let provider = Arc::new(TestProvider::new(ProviderMode::NoRoutes));
        let ledger = Arc::new(RecordingLedger::new());
        let (engine, _store) = test_engine(provider, ledger, PolicyConfig::default());

        let deal = engine.create_deal(cross_chain_deal()).await.unwrap();
        assert!(matches!(
            engine.accept_deal(deal.id).await,
            Err(EscrowError::NoRouteFound { .. })
        ));

        let deal = engine.get_deal(deal.id).await.unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingOtherParty);
        assert!(deal.selected_route.is_none());
    }
}
