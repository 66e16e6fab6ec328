//! Route aggregator adapter
//!
//! Wraps the third-party routing provider behind a trait and degrades to a
//! static fee/latency table when the provider is unreachable, so deal
//! creation never blocks on an external dependency. Degraded quotes carry
//! `confidence_score = 0` and the `EstimateOnly` variant.

use crate::config::{RoutingConfig, StaticEstimate};
use crate::error::{EscrowError, EscrowResult};
use crate::routing::{Route, RouteQuote, RouteRequest, RouteStep, StepKind};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Provider-reported state of an in-flight execution
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderState {
    Pending,
    InProgress,
    Done,
    Failed { retryable: bool },
}

#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub state: ProviderState,
    pub detail: String,
}

/// Abstraction over the routing/bridging service: quote routes, begin an
/// execution, poll its status. Implementations never mutate orchestrator
/// state.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Quote candidate routes for a transfer
    async fn find_routes(&self, request: &RouteRequest) -> EscrowResult<Vec<Route>>;

    /// Begin executing a previously quoted route; returns an opaque handle
    async fn begin_execution(&self, route: &Route) -> EscrowResult<String>;

    /// Poll the status of an execution by handle. Safe to call repeatedly.
    async fn execution_status(&self, handle: &str) -> EscrowResult<ProviderStatus>;
}

/// HTTP/JSON implementation of [`RouteProvider`]
pub struct HttpRouteProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    routes: Vec<RouteDto>,
}

#[derive(Debug, Deserialize)]
struct RouteDto {
    source_network: String,
    destination_network: String,
    source_asset: String,
    destination_asset: String,
    steps: Vec<StepDto>,
    estimated_fee: Decimal,
    estimated_duration_secs: u64,
    confidence_score: f64,
}

#[derive(Debug, Deserialize)]
struct StepDto {
    kind: String,
    provider: String,
    source_asset: String,
    destination_asset: String,
}

#[derive(Debug, Deserialize)]
struct BeginResponse {
    execution_handle: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: String,
    #[serde(default)]
    retryable: bool,
    #[serde(default)]
    detail: String,
}

impl HttpRouteProvider {
    pub fn new(config: &RoutingConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::Config(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            name: config.provider_name.clone(),
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn map_transport_error(&self, operation: &str, e: reqwest::Error) -> EscrowError {
        if e.is_timeout() {
            EscrowError::Timeout {
                operation: operation.to_string(),
            }
        } else {
            EscrowError::ProviderUnavailable {
                provider: self.name.clone(),
                message: e.to_string(),
            }
        }
    }

    fn map_status_error(&self, status: reqwest::StatusCode) -> EscrowError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            EscrowError::RateLimited {
                provider: self.name.clone(),
            }
        } else if status.is_server_error() {
            EscrowError::ProviderUnavailable {
                provider: self.name.clone(),
                message: format!("HTTP {}", status),
            }
        } else {
            EscrowError::Internal(format!("provider returned HTTP {}", status))
        }
    }
}

#[async_trait]
impl RouteProvider for HttpRouteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_routes(&self, request: &RouteRequest) -> EscrowResult<Vec<Route>> {
        let url = format!("{}/v1/routes", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error("route lookup", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EscrowError::NoRouteFound {
                source_network: request.source_network.clone(),
                destination: request.destination_network.clone(),
            });
        }
        if !response.status().is_success() {
            return Err(self.map_status_error(response.status()));
        }

        let body: RoutesResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error("route lookup", e))?;

        let routes = body
            .routes
            .into_iter()
            .map(|dto| Route {
                id: Uuid::new_v4(),
                source_network: dto.source_network,
                destination_network: dto.destination_network,
                source_asset: dto.source_asset,
                destination_asset: dto.destination_asset,
                steps: dto
                    .steps
                    .into_iter()
                    .map(|s| RouteStep {
                        kind: if s.kind == "bridge" {
                            StepKind::Bridge
                        } else {
                            StepKind::Swap
                        },
                        provider: s.provider,
                        source_asset: s.source_asset,
                        destination_asset: s.destination_asset,
                    })
                    .collect(),
                estimated_fee: dto.estimated_fee,
                estimated_duration_secs: dto.estimated_duration_secs,
                confidence_score: dto.confidence_score.clamp(0.0, 1.0),
                provider: self.name.clone(),
            })
            .collect();

        Ok(routes)
    }

    async fn begin_execution(&self, route: &Route) -> EscrowResult<String> {
        let url = format!("{}/v1/executions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(route)
            .send()
            .await
            .map_err(|e| self.map_transport_error("execution start", e))?;

        if !response.status().is_success() {
            return Err(self.map_status_error(response.status()));
        }

        let body: BeginResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error("execution start", e))?;

        Ok(body.execution_handle)
    }

    async fn execution_status(&self, handle: &str) -> EscrowResult<ProviderStatus> {
        let url = format!("{}/v1/executions/{}", self.base_url, handle);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error("execution poll", e))?;

        if !response.status().is_success() {
            return Err(self.map_status_error(response.status()));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error("execution poll", e))?;

        let state = match body.state.as_str() {
            "pending" => ProviderState::Pending,
            "in_progress" => ProviderState::InProgress,
            "done" => ProviderState::Done,
            "failed" => ProviderState::Failed {
                retryable: body.retryable,
            },
            other => {
                debug!("Unrecognized provider state '{}', treating as in_progress", other);
                ProviderState::InProgress
            }
        };

        Ok(ProviderStatus {
            state,
            detail: body.detail,
        })
    }
}

/// Aggregator front: live quotes when the provider answers, static estimates
/// when it does not
pub struct RouteAggregator {
    provider: std::sync::Arc<dyn RouteProvider>,
    static_estimates: Vec<StaticEstimate>,
    default_fee: Decimal,
    default_duration_secs: u64,
}

impl RouteAggregator {
    pub fn new(provider: std::sync::Arc<dyn RouteProvider>, config: &RoutingConfig) -> Self {
        Self {
            provider,
            static_estimates: config.static_estimates.clone(),
            default_fee: config.default_estimate_fee,
            default_duration_secs: config.default_estimate_duration_secs,
        }
    }

    /// Find candidate routes. Transient provider failure degrades to a single
    /// estimate-only placeholder; `NoRouteFound` surfaces to the caller.
    pub async fn find_routes(&self, request: &RouteRequest) -> EscrowResult<Vec<RouteQuote>> {
        match self.provider.find_routes(request).await {
            Ok(routes) if routes.is_empty() => Err(EscrowError::NoRouteFound {
                source_network: request.source_network.clone(),
                destination: request.destination_network.clone(),
            }),
            Ok(routes) => {
                crate::metrics::record_route_lookup("live");
                Ok(routes.into_iter().map(RouteQuote::Live).collect())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Route provider {} unavailable ({}), serving static estimate",
                    self.provider.name(),
                    e
                );
                crate::metrics::record_route_lookup("fallback");
                Ok(vec![RouteQuote::EstimateOnly(self.static_estimate(request))])
            }
            Err(e) => {
                crate::metrics::record_route_lookup("none");
                Err(e)
            }
        }
    }

    /// Build a non-executable placeholder from the static table
    fn static_estimate(&self, request: &RouteRequest) -> Route {
        let (fee, duration) = self
            .static_estimates
            .iter()
            .find(|e| {
                e.source_network == request.source_network
                    && e.destination_network == request.destination_network
            })
            .map(|e| (e.flat_fee, e.duration_secs))
            .unwrap_or((self.default_fee, self.default_duration_secs));

        let cross_chain = request.source_network != request.destination_network;
        let mut steps = Vec::new();
        if cross_chain {
            steps.push(RouteStep {
                kind: StepKind::Bridge,
                provider: "estimate".to_string(),
                source_asset: request.asset.clone(),
                destination_asset: request.asset.clone(),
            });
        } else {
            steps.push(RouteStep {
                kind: StepKind::Swap,
                provider: "estimate".to_string(),
                source_asset: request.asset.clone(),
                destination_asset: request.asset.clone(),
            });
        }

        Route {
            id: Uuid::new_v4(),
            source_network: request.source_network.clone(),
            destination_network: request.destination_network.clone(),
            source_asset: request.asset.clone(),
            destination_asset: request.asset.clone(),
            steps,
            estimated_fee: fee,
            estimated_duration_secs: duration,
            confidence_score: 0.0,
            provider: "static-estimate".to_string(),
        }
    }
}
