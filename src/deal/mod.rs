//! Deal data model: status graph, parties, conditions, and the audit
//! timeline. The transition rules live here as pure data; the engine in
//! [`engine`] applies them against persisted state.

pub mod engine;

pub use engine::DealEngine;

use crate::network::{AssetRef, TransferKind};
use crate::routing::Route;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deal lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    AwaitingOtherParty,
    AwaitingDeposit,
    AwaitingCrossChainDeposit,
    AwaitingFulfillment,
    ReadyForApproval,
    InApproval,
    InDispute,
    AwaitingReleaseExecution,
    Completed,
    Cancelled,
}

impl DealStatus {
    /// Legal transitions of the deal state graph
    pub fn can_transition_to(&self, next: DealStatus) -> bool {
        use DealStatus::*;
        matches!(
            (self, next),
            (AwaitingOtherParty, AwaitingDeposit)
                | (AwaitingOtherParty, AwaitingCrossChainDeposit)
                | (AwaitingOtherParty, Cancelled)
                | (AwaitingDeposit, AwaitingFulfillment)
                | (AwaitingDeposit, Cancelled)
                | (AwaitingCrossChainDeposit, AwaitingFulfillment)
                | (AwaitingCrossChainDeposit, Cancelled)
                | (AwaitingFulfillment, ReadyForApproval)
                | (ReadyForApproval, InApproval)
                | (InApproval, AwaitingReleaseExecution)
                | (InApproval, InDispute)
                | (InDispute, AwaitingReleaseExecution)
                | (InDispute, Cancelled)
                | (AwaitingReleaseExecution, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DealStatus::Completed | DealStatus::Cancelled)
    }

    /// States before funds are locked; explicit cancellation is always
    /// permitted here
    pub fn is_pre_deposit(&self) -> bool {
        matches!(
            self,
            DealStatus::AwaitingOtherParty
                | DealStatus::AwaitingDeposit
                | DealStatus::AwaitingCrossChainDeposit
        )
    }

    /// States in which conditions may be marked fulfilled
    pub fn tracks_conditions(&self) -> bool {
        matches!(
            self,
            DealStatus::AwaitingDeposit
                | DealStatus::AwaitingCrossChainDeposit
                | DealStatus::AwaitingFulfillment
        )
    }

    /// States the deadline scheduler inspects
    pub fn is_time_boxed(&self) -> bool {
        matches!(self, DealStatus::InApproval | DealStatus::InDispute)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::AwaitingOtherParty => "AWAITING_OTHER_PARTY",
            DealStatus::AwaitingDeposit => "AWAITING_DEPOSIT",
            DealStatus::AwaitingCrossChainDeposit => "AWAITING_CROSS_CHAIN_DEPOSIT",
            DealStatus::AwaitingFulfillment => "AWAITING_FULFILLMENT",
            DealStatus::ReadyForApproval => "READY_FOR_APPROVAL",
            DealStatus::InApproval => "IN_APPROVAL",
            DealStatus::InDispute => "IN_DISPUTE",
            DealStatus::AwaitingReleaseExecution => "AWAITING_RELEASE_EXECUTION",
            DealStatus::Completed => "COMPLETED",
            DealStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a deal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub network: String,
    pub address: String,
}

/// Fixed condition kinds plus free-form custom ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Inspection,
    Documents,
    Delivery,
    NetworkCompatibility,
    Custom,
}

/// A named requirement gating release. Never deleted once created; the only
/// mutation is marking it fulfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub id: Uuid,
    pub kind: ConditionKind,
    pub description: String,
    pub fulfilled: bool,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(kind: ConditionKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            description: description.into(),
            fulfilled: false,
            fulfilled_at: None,
        }
    }
}

/// Timeline entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Accepted,
    RouteCommitted,
    AwaitingManualRoute,
    DepositRequested,
    DepositConfirmed,
    ConditionFulfilled,
    ReadyForApproval,
    ApprovalStarted,
    ApprovalConfirmed,
    ApprovalElapsed,
    DisputeRaised,
    DisputeResolved,
    DisputeElapsed,
    ReleaseRequested,
    RefundRequested,
    ExecutionStatus,
    ManualReviewFlagged,
    Cancelled,
    Completed,
}

/// Append-only audit event. `seq` follows transition commit order, not
/// wall-clock arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

/// A route committed to a deal. Failed attempts are retained; re-selection
/// appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAttempt {
    pub route: Route,
    pub committed_at: DateTime<Utc>,
    pub execution_id: Option<Uuid>,
}

/// One escrow transaction between two parties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    /// Persistence version for compare-and-swap writes
    pub version: u64,
    pub status: DealStatus,
    pub buyer: Party,
    pub seller: Party,
    pub amount: Decimal,
    /// `None` means the native asset of the buyer's network
    pub asset: Option<AssetRef>,
    pub transfer_kind: TransferKind,
    pub selected_route: Option<Route>,
    pub route_attempts: Vec<RouteAttempt>,
    pub execution_id: Option<Uuid>,
    pub conditions: Vec<Condition>,
    pub timeline: Vec<DealEvent>,
    pub awaiting_manual_route: bool,
    pub needs_manual_review: bool,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub dispute_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// Derived: the parties hold funds on different networks
    pub fn is_cross_chain(&self) -> bool {
        self.buyer.network != self.seller.network
    }

    pub fn all_conditions_fulfilled(&self) -> bool {
        self.conditions.iter().all(|c| c.fulfilled)
    }

    pub fn condition_mut(&mut self, condition_id: Uuid) -> Option<&mut Condition> {
        self.conditions.iter_mut().find(|c| c.id == condition_id)
    }

    /// Append an audit event; seq reflects commit order within the deal
    pub fn record_event(&mut self, kind: EventKind, detail: impl Into<String>) {
        let seq = self.timeline.len() as u64;
        self.timeline.push(DealEvent {
            seq,
            at: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Asset symbol to move, falling back to the source network native symbol
    pub fn asset_symbol(&self, native: &str) -> String {
        self.asset
            .as_ref()
            .map(|a| a.symbol.clone())
            .unwrap_or_else(|| native.to_string())
    }
}
