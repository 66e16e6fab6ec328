//! Meridian - cross-chain escrow lifecycle orchestrator
//!
//! The daemon owns the per-deal state machine, route selection, execution
//! monitoring, and the deadline sweep, and exposes the operation surface
//! over HTTP to the surrounding API layer.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

mod api;
mod config;
mod deal;
mod error;
mod execution;
mod ledger;
mod metrics;
mod network;
mod routing;
mod scheduler;
mod store;

use config::Settings;
use deal::DealEngine;
use ledger::HttpEscrowLedger;
use metrics::MetricsServer;
use routing::aggregator::HttpRouteProvider;
use store::{OrchestratorStore, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Meridian escrow orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration (instance {})",
        settings.orchestrator.instance_id
    );

    // Initialize database connection
    let postgres = PostgresStore::new(&settings.database).await?;
    postgres.run_migrations().await?;
    let store: Arc<dyn OrchestratorStore> = Arc::new(postgres);
    info!("Database connection established");

    // Collaborators
    let ledger = Arc::new(HttpEscrowLedger::new(&settings.ledger)?);
    let provider = Arc::new(HttpRouteProvider::new(&settings.routing)?);

    // Deal engine
    let engine = Arc::new(DealEngine::new(
        store.clone(),
        ledger,
        provider,
        settings.routing.clone(),
        settings.policy.clone(),
    ));
    info!("Deal engine initialized");

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(api_config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    let shutdown = Arc::new(RwLock::new(false));

    // Deadline sweep loop
    let sweep_handle = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let interval_secs = settings.orchestrator.sweep_interval_secs;
        async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    break;
                }
                let report = scheduler::run_sweep(&engine, chrono::Utc::now()).await;
                if report.errors > 0 {
                    warn!("Sweep finished with {} errors", report.errors);
                }
            }
            info!("Sweep loop stopped");
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval_secs = settings.orchestrator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Meridian is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop sweeping first so no transition races the exit
    *shutdown.write().await = true;

    api_handle.abort();
    sweep_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Meridian stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,meridian_escrow=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
