//! Error types for the escrow orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Deal {deal_id} is {current}, cannot apply {requested}")]
    StateConflict {
        deal_id: Uuid,
        current: String,
        requested: String,
    },

    #[error("Concurrent write on {entity} {id}, re-fetch and retry")]
    WriteConflict { entity: &'static str, id: Uuid },

    #[error("Deal {deal_id} not found")]
    DealNotFound { deal_id: Uuid },

    #[error("Execution {execution_id} not found")]
    ExecutionNotFound { execution_id: Uuid },

    #[error("Condition {condition_id} not found on deal {deal_id}")]
    ConditionNotFound { deal_id: Uuid, condition_id: Uuid },

    #[error("Unknown network: {network}")]
    UnknownNetwork { network: String },

    #[error("Route provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Rate limited by provider {provider}")]
    RateLimited { provider: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("No route found from {source_network} to {destination}")]
    NoRouteFound { source_network: String, destination: String },

    #[error("No executable route among candidates")]
    NoExecutableRoute,

    #[error("Execution rejected: {reason}")]
    ExecutionRejected { reason: String },

    #[error("Execution {execution_id} failed: {reason}")]
    ExecutionFailed { execution_id: Uuid, reason: String },

    #[error("Escrow ledger error: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Check if error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::ProviderUnavailable { .. }
                | EscrowError::RateLimited { .. }
                | EscrowError::Timeout { .. }
                | EscrowError::Ledger(_)
        )
    }

    /// Check if the failure leaves funds in an unknown state and must be
    /// reconciled by an operator rather than retried from the UI
    pub fn needs_manual_review(&self) -> bool {
        matches!(self, EscrowError::ExecutionFailed { .. })
    }
}

/// Result type for orchestrator operations
pub type EscrowResult<T> = Result<T, EscrowError>;
