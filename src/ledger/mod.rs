//! Escrow ledger collaborator
//!
//! The on-chain escrow contract is reached through this interface only. All
//! three operations are requests against an eventually-consistent event
//! source: the receipt means "accepted", never "confirmed". Confirmations
//! arrive later through deposit proofs or execution status reports.

use crate::config::LedgerConfig;
use crate::error::{EscrowError, EscrowResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Acknowledgement that the ledger accepted a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub reference: String,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait EscrowLedger: Send + Sync {
    /// Register an expected deposit for a deal
    async fn deposit(&self, deal_id: Uuid, amount: Decimal) -> EscrowResult<LedgerReceipt>;

    /// Request release of escrowed funds to an address
    async fn release(&self, deal_id: Uuid, to: &str) -> EscrowResult<LedgerReceipt>;

    /// Request refund of escrowed funds to the depositor
    async fn refund(&self, deal_id: Uuid) -> EscrowResult<LedgerReceipt>;
}

/// HTTP client implementation
pub struct HttpEscrowLedger {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct DepositRequest {
    deal_id: Uuid,
    amount: Decimal,
}

#[derive(Serialize)]
struct ReleaseRequest {
    deal_id: Uuid,
    to: String,
}

#[derive(Serialize)]
struct RefundRequest {
    deal_id: Uuid,
}

#[derive(Deserialize)]
struct ReceiptResponse {
    reference: String,
}

impl HttpEscrowLedger {
    pub fn new(config: &LedgerConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::Config(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> EscrowResult<LedgerReceipt> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EscrowError::Timeout {
                        operation: format!("ledger {}", path),
                    }
                } else {
                    EscrowError::Ledger(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(EscrowError::Ledger(format!(
                "{} returned HTTP {}",
                path,
                response.status()
            )));
        }

        let receipt: ReceiptResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::Ledger(e.to_string()))?;

        Ok(LedgerReceipt {
            reference: receipt.reference,
            accepted_at: Utc::now(),
        })
    }
}

#[async_trait]
impl EscrowLedger for HttpEscrowLedger {
    async fn deposit(&self, deal_id: Uuid, amount: Decimal) -> EscrowResult<LedgerReceipt> {
        self.post("/v1/deposits", &DepositRequest { deal_id, amount })
            .await
    }

    async fn release(&self, deal_id: Uuid, to: &str) -> EscrowResult<LedgerReceipt> {
        self.post(
            "/v1/releases",
            &ReleaseRequest {
                deal_id,
                to: to.to_string(),
            },
        )
        .await
    }

    async fn refund(&self, deal_id: Uuid) -> EscrowResult<LedgerReceipt> {
        self.post("/v1/refunds", &RefundRequest { deal_id }).await
    }
}
