//! PostgreSQL-backed store
//!
//! Records persist as one JSONB document per deal/execution with a version
//! column enforcing the compare-and-swap contract in SQL.

use super::{DealStats, OrchestratorStore};
use crate::config::DatabaseConfig;
use crate::deal::{Deal, DealStatus};
use crate::error::{EscrowError, EscrowResult};
use crate::execution::Execution;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(config: &DatabaseConfig) -> EscrowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(EscrowError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EscrowResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deals (
                id UUID PRIMARY KEY,
                status VARCHAR(40) NOT NULL,
                version BIGINT NOT NULL,
                needs_manual_review BOOLEAN NOT NULL DEFAULT FALSE,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deals_status
            ON deals (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                deal_id UUID NOT NULL,
                status VARCHAR(20) NOT NULL,
                version BIGINT NOT NULL,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_status
            ON executions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl OrchestratorStore for PostgresStore {
    async fn insert_deal(&self, deal: &Deal) -> EscrowResult<()> {
        let doc = serde_json::to_value(deal)?;
        sqlx::query(
            r#"
            INSERT INTO deals (id, status, version, needs_manual_review, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(deal.id)
        .bind(deal.status.as_str())
        .bind(deal.version as i64)
        .bind(deal.needs_manual_review)
        .bind(doc)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_deal(&self, id: Uuid) -> EscrowResult<Option<Deal>> {
        let row = sqlx::query("SELECT doc FROM deals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let doc: serde_json::Value = row.get("doc");
                Ok(Some(serde_json::from_value(doc)?))
            }
            None => Ok(None),
        }
    }

    async fn update_deal(&self, deal: &mut Deal) -> EscrowResult<()> {
        let expected = deal.version;
        deal.version += 1;
        deal.updated_at = chrono::Utc::now();
        let doc = serde_json::to_value(&deal)?;

        let result = sqlx::query(
            r#"
            UPDATE deals
            SET status = $2, version = $3, needs_manual_review = $4, doc = $5, updated_at = $6
            WHERE id = $1 AND version = $7
            "#,
        )
        .bind(deal.id)
        .bind(deal.status.as_str())
        .bind(deal.version as i64)
        .bind(deal.needs_manual_review)
        .bind(doc)
        .bind(deal.updated_at)
        .bind(expected as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            deal.version = expected;
            return Err(EscrowError::WriteConflict {
                entity: "deal",
                id: deal.id,
            });
        }

        Ok(())
    }

    async fn deals_in_status(&self, statuses: &[DealStatus]) -> EscrowResult<Vec<Deal>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query("SELECT doc FROM deals WHERE status = ANY($1)")
            .bind(&names)
            .fetch_all(&self.pool)
            .await?;

        let mut deals = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: serde_json::Value = row.get("doc");
            deals.push(serde_json::from_value(doc)?);
        }
        Ok(deals)
    }

    async fn insert_execution(&self, execution: &Execution) -> EscrowResult<()> {
        let doc = serde_json::to_value(execution)?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, deal_id, status, version, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.id)
        .bind(execution.deal_id)
        .bind(execution.status.as_str())
        .bind(execution.version as i64)
        .bind(doc)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> EscrowResult<Option<Execution>> {
        let row = sqlx::query("SELECT doc FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let doc: serde_json::Value = row.get("doc");
                Ok(Some(serde_json::from_value(doc)?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(&self, execution: &mut Execution) -> EscrowResult<()> {
        let expected = execution.version;
        execution.version += 1;
        execution.updated_at = chrono::Utc::now();
        let doc = serde_json::to_value(&execution)?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, version = $3, doc = $4, updated_at = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(execution.version as i64)
        .bind(doc)
        .bind(execution.updated_at)
        .bind(expected as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            execution.version = expected;
            return Err(EscrowError::WriteConflict {
                entity: "execution",
                id: execution.id,
            });
        }

        Ok(())
    }

    async fn executions_in_flight(&self) -> EscrowResult<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM executions
            WHERE status NOT IN ('DONE', 'FAILED')
               OR (status = 'FAILED' AND doc->>'next_retry_at' IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: serde_json::Value = row.get("doc");
            executions.push(serde_json::from_value(doc)?);
        }
        Ok(executions)
    }

    async fn health_check(&self) -> EscrowResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(EscrowError::Database)?;
        Ok(())
    }

    async fn stats(&self) -> EscrowResult<DealStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status NOT IN
                    ('IN_APPROVAL', 'IN_DISPUTE', 'COMPLETED', 'CANCELLED')) as open,
                COUNT(*) FILTER (WHERE status = 'IN_APPROVAL') as in_approval,
                COUNT(*) FILTER (WHERE status = 'IN_DISPUTE') as in_dispute,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed,
                COUNT(*) FILTER (WHERE status = 'CANCELLED') as cancelled,
                COUNT(*) FILTER (WHERE needs_manual_review) as needs_manual_review
            FROM deals
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DealStats {
            open: row.get::<i64, _>("open") as u64,
            in_approval: row.get::<i64, _>("in_approval") as u64,
            in_dispute: row.get::<i64, _>("in_dispute") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            cancelled: row.get::<i64, _>("cancelled") as u64,
            needs_manual_review: row.get::<i64, _>("needs_manual_review") as u64,
        })
    }
}
