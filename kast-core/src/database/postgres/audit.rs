use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgRow};
use uuid::Uuid;

use super::column;
use crate::database::ports::AuditRepository;
use crate::error::{Result, ScanError};
use crate::types::{AuditId, AuditOrigin, AuditRecord, PrincipalId};

/// [`AuditRepository`] over the `audit_log` table.
#[derive(Debug, Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    /// Repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<AuditRecord> {
        let principal: Option<Uuid> = column(row, "principal_id")?;
        Ok(AuditRecord {
            id: AuditId(column(row, "id")?),
            principal_id: principal.map(PrincipalId),
            action: column(row, "action")?,
            resource: column(row, "resource")?,
            detail: column(row, "detail")?,
            origin: AuditOrigin {
                client_addr: column(row, "client_addr")?,
                user_agent: column(row, "user_agent")?,
            },
            recorded_at: column(row, "recorded_at")?,
        })
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, principal_id, action, resource, detail, client_addr, user_agent, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.principal_id.map(|id| id.as_uuid()))
        .bind(&record.action)
        .bind(&record.resource)
        .bind(&record.detail)
        .bind(&record.origin.client_addr)
        .bind(&record.origin.user_agent)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to append audit record: {e}")))?;
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, principal_id, action, resource, detail, client_addr, user_agent, recorded_at
            FROM audit_log
            ORDER BY recorded_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to load audit records: {e}")))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to prune audit records: {e}")))?;
        Ok(result.rows_affected())
    }
}
