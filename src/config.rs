//! Configuration management for the escrow orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every policy constant (time windows, retry bounds, scoring weights) lives
//! here rather than in the logic that consumes it.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    pub routing: RoutingConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    pub sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Lifecycle policy constants. The approval and dispute windows are policy,
/// not protocol: deployments may shorten or extend them without code changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub approval_window_secs: i64,
    pub dispute_window_secs: i64,
    pub max_execution_retries: u32,
    pub retry_base_delay_secs: i64,
    pub stuck_timeout_multiplier: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            approval_window_secs: 48 * 3600,
            dispute_window_secs: 7 * 24 * 3600,
            max_execution_retries: 3,
            retry_base_delay_secs: 30,
            stuck_timeout_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    pub provider_name: String,
    pub provider_url: String,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub static_estimates: Vec<StaticEstimate>,
    /// Fallback used when no (source, destination) pair matches
    #[serde(default = "default_fallback_fee")]
    pub default_estimate_fee: Decimal,
    #[serde(default = "default_fallback_duration")]
    pub default_estimate_duration_secs: u64,
}

fn default_fallback_fee() -> Decimal {
    Decimal::new(5, 0)
}

fn default_fallback_duration() -> u64 {
    1800
}

/// Route scoring weights, normalized terms each in [0, 1]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub fee: f64,
    pub duration: f64,
    pub confidence: f64,
    pub steps: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            fee: 0.35,
            duration: 0.25,
            confidence: 0.30,
            steps: 0.10,
        }
    }
}

/// One row of the static fee/latency table used when the live provider is down
#[derive(Debug, Clone, Deserialize)]
pub struct StaticEstimate {
    pub source_network: String,
    pub destination_network: String,
    pub flat_fee: Decimal,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.policy.approval_window_secs <= 0 {
            anyhow::bail!("approval_window_secs must be positive");
        }
        if self.policy.dispute_window_secs <= 0 {
            anyhow::bail!("dispute_window_secs must be positive");
        }
        if self.policy.stuck_timeout_multiplier < 1.0 {
            anyhow::bail!("stuck_timeout_multiplier must be >= 1.0");
        }

        let w = &self.routing.weights;
        if w.fee < 0.0 || w.duration < 0.0 || w.confidence < 0.0 || w.steps < 0.0 {
            anyhow::bail!("scoring weights must be non-negative");
        }
        if w.fee + w.duration + w.confidence + w.steps <= 0.0 {
            anyhow::bail!("at least one scoring weight must be positive");
        }

        if self.routing.provider_url.is_empty() {
            anyhow::bail!("routing.provider_url must be configured");
        }
        if self.ledger.base_url.is_empty() {
            anyhow::bail!("ledger.base_url must be configured");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
