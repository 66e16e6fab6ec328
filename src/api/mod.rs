//! HTTP surface exposing the orchestrator operations, health checks, and
//! statistics to the surrounding CRUD/API layer. Authentication and
//! authorization are that layer's concern, not this one's.

use crate::config::ApiConfig;
use crate::deal::engine::{DisputeOutcome, NewDeal};
use crate::deal::{Deal, DealEngine};
use crate::error::{EscrowError, EscrowResult};
use crate::scheduler::{self, SweepReport};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DealEngine>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<DealEngine>) -> EscrowResult<()> {
    let state = AppState { engine };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/networks", get(list_networks))
        .route("/stats", get(get_stats))
        .route("/deals", post(create_deal))
        .route("/deals/:id", get(get_deal))
        .route("/deals/:id/accept", post(accept_deal))
        .route("/deals/:id/deposit", post(record_deposit))
        .route(
            "/deals/:id/conditions/:condition_id/fulfill",
            post(fulfill_condition),
        )
        .route("/deals/:id/approval", post(start_approval))
        .route("/deals/:id/approve", post(approve_release))
        .route("/deals/:id/dispute", post(raise_dispute))
        .route("/deals/:id/dispute/resolve", post(resolve_dispute))
        .route("/deals/:id/cancel", post(cancel_deal))
        .route("/sweep", post(trigger_sweep))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EscrowError::Config(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EscrowError::Internal(e.to_string()))?;

    Ok(())
}

/// Error wrapper mapping the orchestrator taxonomy onto status codes
struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EscrowError::DealNotFound { .. }
            | EscrowError::ExecutionNotFound { .. }
            | EscrowError::ConditionNotFound { .. } => StatusCode::NOT_FOUND,
            EscrowError::StateConflict { .. } | EscrowError::WriteConflict { .. } => {
                StatusCode::CONFLICT
            }
            EscrowError::Validation(_)
            | EscrowError::UnknownNetwork { .. }
            | EscrowError::ExecutionRejected { .. } => StatusCode::BAD_REQUEST,
            EscrowError::NoRouteFound { .. } | EscrowError::NoExecutableRoute => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EscrowError::ProviderUnavailable { .. }
            | EscrowError::RateLimited { .. }
            | EscrowError::Timeout { .. }
            | EscrowError::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                retryable: self.0.is_retryable(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// Handlers

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.engine.store().health_check().await.is_ok();

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: store_ok,
            store: store_ok,
        }),
    )
}

/// Supported networks and their capabilities
async fn list_networks() -> Json<Vec<crate::network::NetworkInfo>> {
    Json(crate::network::NetworkRegistry::builtin().all().to_vec())
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let stats = state.engine.store().stats().await?;
    crate::metrics::record_deal_gauge("open", stats.open);
    crate::metrics::record_deal_gauge("in_approval", stats.in_approval);
    crate::metrics::record_deal_gauge("in_dispute", stats.in_dispute);
    Ok(Json(StatsResponse {
        open: stats.open,
        in_approval: stats.in_approval,
        in_dispute: stats.in_dispute,
        completed: stats.completed,
        cancelled: stats.cancelled,
        needs_manual_review: stats.needs_manual_review,
    }))
}

async fn create_deal(
    State(state): State<AppState>,
    Json(request): Json<NewDeal>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.create_deal(request).await?))
}

async fn get_deal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.get_deal(id).await?))
}

async fn accept_deal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.accept_deal(id).await?))
}

async fn record_deposit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DepositBody>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.record_deposit(id, &body.proof).await?))
}

async fn fulfill_condition(
    State(state): State<AppState>,
    Path((id, condition_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.fulfill_condition(id, condition_id).await?))
}

async fn start_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.start_approval(id).await?))
}

async fn approve_release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.approve_release(id).await?))
}

async fn raise_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.raise_dispute(id).await?))
}

async fn resolve_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.resolve_dispute(id, body.outcome).await?))
}

async fn cancel_deal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deal>> {
    Ok(Json(state.engine.cancel_deal(id).await?))
}

/// Cron-style external trigger for the deadline sweep
async fn trigger_sweep(State(state): State<AppState>) -> Json<SweepReport> {
    let report = scheduler::run_sweep(&state.engine, chrono::Utc::now()).await;
    Json(report)
}

// Request/response types

#[derive(Deserialize)]
struct DepositBody {
    proof: String,
}

#[derive(Deserialize)]
struct ResolveBody {
    outcome: DisputeOutcome,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    retryable: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    open: u64,
    in_approval: u64,
    in_dispute: u64,
    completed: u64,
    cancelled: u64,
    needs_manual_review: u64,
}
