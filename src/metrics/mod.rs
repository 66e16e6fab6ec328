//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Deal lifecycle transitions
//! - Route lookups and selection outcomes
//! - Execution progress, retries, and failures
//! - Scheduler sweeps

use crate::error::EscrowResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Deal metrics
    pub static ref DEALS_CREATED: CounterVec = register_counter_vec!(
        "meridian_deals_created_total",
        "Total deals created by transfer kind",
        &["transfer_kind"]
    ).unwrap();

    pub static ref DEAL_TRANSITIONS: CounterVec = register_counter_vec!(
        "meridian_deal_transitions_total",
        "Total deal status transitions by target status",
        &["to_status"]
    ).unwrap();

    pub static ref DEALS_FLAGGED_MANUAL: CounterVec = register_counter_vec!(
        "meridian_deals_flagged_manual_total",
        "Total deals flagged for manual review",
        &[]
    ).unwrap();

    // Routing metrics
    pub static ref ROUTE_LOOKUPS: CounterVec = register_counter_vec!(
        "meridian_route_lookups_total",
        "Total route lookups by outcome (live, fallback, none)",
        &["outcome"]
    ).unwrap();

    // Execution metrics
    pub static ref EXECUTIONS_STARTED: CounterVec = register_counter_vec!(
        "meridian_executions_started_total",
        "Total executions started",
        &["provider"]
    ).unwrap();

    pub static ref EXECUTION_RETRIES: CounterVec = register_counter_vec!(
        "meridian_execution_retries_total",
        "Total execution retry attempts",
        &["provider"]
    ).unwrap();

    pub static ref EXECUTIONS_FAILED: CounterVec = register_counter_vec!(
        "meridian_executions_failed_total",
        "Total execution failures",
        &["provider"]
    ).unwrap();

    pub static ref EXECUTION_LATENCY: HistogramVec = register_histogram_vec!(
        "meridian_execution_latency_seconds",
        "Execution wall-clock latency from start to DONE",
        &["provider"],
        vec![30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 14400.0, 86400.0]
    ).unwrap();

    // Scheduler metrics
    pub static ref SWEEP_RUNS: CounterVec = register_counter_vec!(
        "meridian_sweep_runs_total",
        "Total scheduler sweeps",
        &[]
    ).unwrap();

    pub static ref SWEEP_ACTIONS: CounterVec = register_counter_vec!(
        "meridian_sweep_actions_total",
        "Total scheduler actions by kind",
        &["action"]
    ).unwrap();

    // Store metrics
    pub static ref DEALS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "meridian_deals_by_status",
        "Deal counts by coarse status bucket",
        &["bucket"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "meridian_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "meridian_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EscrowResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::EscrowError::Config(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::EscrowError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_deal_created(transfer_kind: &str) {
    DEALS_CREATED.with_label_values(&[transfer_kind]).inc();
}

pub fn record_deal_transition(to_status: &str) {
    DEAL_TRANSITIONS.with_label_values(&[to_status]).inc();
}

pub fn record_manual_review_flag() {
    DEALS_FLAGGED_MANUAL.with_label_values(&[]).inc();
}

pub fn record_route_lookup(outcome: &str) {
    ROUTE_LOOKUPS.with_label_values(&[outcome]).inc();
}

pub fn record_execution_started(provider: &str) {
    EXECUTIONS_STARTED.with_label_values(&[provider]).inc();
}

pub fn record_execution_retry(provider: &str) {
    EXECUTION_RETRIES.with_label_values(&[provider]).inc();
}

pub fn record_execution_failed(provider: &str) {
    EXECUTIONS_FAILED.with_label_values(&[provider]).inc();
}

pub fn record_execution_latency(provider: &str, latency_secs: f64) {
    EXECUTION_LATENCY
        .with_label_values(&[provider])
        .observe(latency_secs);
}

pub fn record_sweep_run() {
    SWEEP_RUNS.with_label_values(&[]).inc();
}

pub fn record_sweep_action(action: &str) {
    SWEEP_ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_deal_gauge(bucket: &str, count: u64) {
    DEALS_BY_STATUS
        .with_label_values(&[bucket])
        .set(count as f64);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
