//! Route model and cross-chain routing
//!
//! This module provides:
//! - The route data model shared by the aggregator, selector, and driver
//! - The route aggregator adapter with a static-estimate degradation path
//! - The pure weighted route selector

pub mod aggregator;
pub mod selector;

pub use aggregator::{ProviderState, ProviderStatus, RouteAggregator, RouteProvider};
pub use selector::{select_route, Selection};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One leg of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Swap,
    Bridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStep {
    pub kind: StepKind,
    /// Liquidity or bridge protocol executing this leg
    pub provider: String,
    pub source_asset: String,
    pub destination_asset: String,
}

/// A candidate or committed execution plan, immutable once returned by the
/// aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub source_network: String,
    pub destination_network: String,
    pub source_asset: String,
    pub destination_asset: String,
    pub steps: Vec<RouteStep>,
    pub estimated_fee: Decimal,
    pub estimated_duration_secs: u64,
    /// Provider-reported likelihood of completion, in [0, 1]
    pub confidence_score: f64,
    /// Aggregator that produced the route
    pub provider: String,
}

/// A route quote. The two variants keep estimate-only placeholders apart from
/// executable routes at the type level: the execution driver only accepts
/// `Live`, so a degraded quote can be displayed but never driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteQuote {
    Live(Route),
    EstimateOnly(Route),
}

impl RouteQuote {
    pub fn route(&self) -> &Route {
        match self {
            RouteQuote::Live(r) | RouteQuote::EstimateOnly(r) => r,
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, RouteQuote::Live(_))
    }
}

/// Inputs for a route lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub source_network: String,
    pub destination_network: String,
    /// Asset symbol; native asset of the source network when the deal has no
    /// token asset
    pub asset: String,
    pub amount: Decimal,
    pub from_address: String,
    pub to_address: String,
}
