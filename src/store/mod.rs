//! Persistence: an abstract transactional document store with
//! compare-and-swap writes keyed by record id.
//!
//! Per-deal optimistic concurrency control lives here: every record carries
//! a version, and an update only lands when the stored version matches the
//! one the caller loaded. Unrelated deals never contend.

pub mod postgres;

pub use postgres::PostgresStore;

use crate::deal::{Deal, DealStatus};
use crate::error::{EscrowError, EscrowResult};
use crate::execution::Execution;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Deal counts by status, for the operations API
#[derive(Debug, Clone, Default)]
pub struct DealStats {
    pub open: u64,
    pub in_approval: u64,
    pub in_dispute: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub needs_manual_review: u64,
}

/// Store contract shared by the engine, driver, and scheduler
#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn insert_deal(&self, deal: &Deal) -> EscrowResult<()>;

    async fn get_deal(&self, id: Uuid) -> EscrowResult<Option<Deal>>;

    /// Compare-and-swap write: succeeds only when the stored version equals
    /// `deal.version`, then bumps the version on the passed record
    async fn update_deal(&self, deal: &mut Deal) -> EscrowResult<()>;

    async fn deals_in_status(&self, statuses: &[DealStatus]) -> EscrowResult<Vec<Deal>>;

    async fn insert_execution(&self, execution: &Execution) -> EscrowResult<()>;

    async fn get_execution(&self, id: Uuid) -> EscrowResult<Option<Execution>>;

    /// CAS write with the same contract as `update_deal`
    async fn update_execution(&self, execution: &mut Execution) -> EscrowResult<()>;

    /// Executions the sweep still owns: everything except DONE and
    /// permanently failed records (FAILED with no retry scheduled)
    async fn executions_in_flight(&self) -> EscrowResult<Vec<Execution>>;

    async fn health_check(&self) -> EscrowResult<()>;

    async fn stats(&self) -> EscrowResult<DealStats>;
}

/// In-memory store used by tests and single-node development runs
pub struct MemoryStore {
    deals: DashMap<Uuid, Deal>,
    executions: DashMap<Uuid, Execution>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            deals: DashMap::new(),
            executions: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrchestratorStore for MemoryStore {
    async fn insert_deal(&self, deal: &Deal) -> EscrowResult<()> {
        if self.deals.contains_key(&deal.id) {
            return Err(EscrowError::Validation(format!(
                "deal {} already exists",
                deal.id
            )));
        }
        self.deals.insert(deal.id, deal.clone());
        Ok(())
    }

    async fn get_deal(&self, id: Uuid) -> EscrowResult<Option<Deal>> {
        Ok(self.deals.get(&id).map(|d| d.clone()))
    }

    async fn update_deal(&self, deal: &mut Deal) -> EscrowResult<()> {
        let mut stored = self
            .deals
            .get_mut(&deal.id)
            .ok_or(EscrowError::DealNotFound { deal_id: deal.id })?;
        if stored.version != deal.version {
            return Err(EscrowError::WriteConflict {
                entity: "deal",
                id: deal.id,
            });
        }
        deal.version += 1;
        deal.updated_at = chrono::Utc::now();
        *stored = deal.clone();
        Ok(())
    }

    async fn deals_in_status(&self, statuses: &[DealStatus]) -> EscrowResult<Vec<Deal>> {
        Ok(self
            .deals
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn insert_execution(&self, execution: &Execution) -> EscrowResult<()> {
        if self.executions.contains_key(&execution.id) {
            return Err(EscrowError::Validation(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> EscrowResult<Option<Execution>> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn update_execution(&self, execution: &mut Execution) -> EscrowResult<()> {
        let mut stored = self.executions.get_mut(&execution.id).ok_or(
            EscrowError::ExecutionNotFound {
                execution_id: execution.id,
            },
        )?;
        if stored.version != execution.version {
            return Err(EscrowError::WriteConflict {
                entity: "execution",
                id: execution.id,
            });
        }
        execution.version += 1;
        execution.updated_at = chrono::Utc::now();
        *stored = execution.clone();
        Ok(())
    }

    async fn executions_in_flight(&self) -> EscrowResult<Vec<Execution>> {
        use crate::execution::ExecutionStatus;
        Ok(self
            .executions
            .iter()
            .filter(|entry| match entry.status {
                ExecutionStatus::Done => false,
                ExecutionStatus::Failed => entry.next_retry_at.is_some(),
                _ => true,
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn health_check(&self) -> EscrowResult<()> {
        Ok(())
    }

    async fn stats(&self) -> EscrowResult<DealStats> {
        let mut stats = DealStats::default();
        for entry in self.deals.iter() {
            match entry.status {
                DealStatus::InApproval => stats.in_approval += 1,
                DealStatus::InDispute => stats.in_dispute += 1,
                DealStatus::Completed => stats.completed += 1,
                DealStatus::Cancelled => stats.cancelled += 1,
                _ => stats.open += 1,
            }
            if entry.needs_manual_review {
                stats.needs_manual_review += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deal::{EventKind, Party};
    use crate::network::TransferKind;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn sample_deal() -> Deal {
        Deal {
            id: Uuid::new_v4(),
            version: 0,
            status: DealStatus::AwaitingOtherParty,
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
            transfer_kind: TransferKind::SameChain,
            selected_route: None,
            route_attempts: Vec::new(),
            execution_id: None,
            conditions: Vec::new(),
            timeline: Vec::new(),
            awaiting_manual_route: false,
            needs_manual_review: false,
            approval_deadline: None,
            dispute_deadline: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_write() {
        let store = MemoryStore::new();
        let mut deal = sample_deal();
        store.insert_deal(&deal).await.unwrap();

        // Two readers load the same version
        let mut first = store.get_deal(deal.id).await.unwrap().unwrap();
        let mut second = store.get_deal(deal.id).await.unwrap().unwrap();

        first.record_event(EventKind::Accepted, "accepted");
        store.update_deal(&mut first).await.unwrap();
        assert_eq!(first.version, 1);

        // The stale writer loses
        second.record_event(EventKind::Cancelled, "cancelled");
        assert!(matches!(
            store.update_deal(&mut second).await,
            Err(EscrowError::WriteConflict { .. })
        ));

        // The original handle is stale too
        deal.record_event(EventKind::Cancelled, "cancelled");
        assert!(store.update_deal(&mut deal).await.is_err());
    }

    #[tokio::test]
    async fn test_status_query_and_stats() {
        let store = MemoryStore::new();

        let mut a = sample_deal();
        a.status = DealStatus::InApproval;
        let mut b = sample_deal();
        b.status = DealStatus::InDispute;
        let c = sample_deal();

        store.insert_deal(&a).await.unwrap();
        store.insert_deal(&b).await.unwrap();
        store.insert_deal(&c).await.unwrap();

        let boxed = store
            .deals_in_status(&[DealStatus::InApproval, DealStatus::InDispute])
            .await
            .unwrap();
        assert_eq!(boxed.len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.in_approval, 1);
        assert_eq!(stats.in_dispute, 1);
        assert_eq!(stats.open, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let deal = sample_deal();
        store.insert_deal(&deal).await.unwrap();
        assert!(store.insert_deal(&deal).await.is_err());
    }
}
