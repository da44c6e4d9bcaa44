use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgRow};
use uuid::Uuid;

use super::column;
use crate::database::ports::ShareGrantRepository;
use crate::error::{Result, ScanError};
use crate::types::{JobId, PrincipalId, ShareGrant, ShareId, ShareScope};

const SHARE_COLUMNS: &str = r#"
    id, job_id, grantee_id, token_hash, permission, granted_by,
    created_at, expires_at, revoked_at
"#;

/// [`ShareGrantRepository`] over the `share_grants` table.
#[derive(Debug, Clone)]
pub struct PostgresShareGrantRepository {
    pool: PgPool,
}

impl PostgresShareGrantRepository {
    /// Repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<ShareGrant> {
        let grantee: Option<Uuid> = column(row, "grantee_id")?;
        let token_hash: Option<String> = column(row, "token_hash")?;
        let scope = match (grantee, token_hash) {
            (Some(grantee), None) => ShareScope::Principal {
                grantee_id: PrincipalId(grantee),
            },
            (None, Some(token_hash)) => ShareScope::PublicLink { token_hash },
            _ => {
                return Err(ScanError::Storage(
                    "share grant must have exactly one of grantee or token".into(),
                ));
            }
        };
        let permission: String = column(row, "permission")?;

        Ok(ShareGrant {
            id: ShareId(column(row, "id")?),
            job_id: JobId(column(row, "job_id")?),
            scope,
            permission: permission.parse()?,
            granted_by: PrincipalId(column(row, "granted_by")?),
            created_at: column(row, "created_at")?,
            expires_at: column(row, "expires_at")?,
            revoked_at: column(row, "revoked_at")?,
        })
    }
}

#[async_trait]
impl ShareGrantRepository for PostgresShareGrantRepository {
    async fn insert(&self, grant: &ShareGrant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO share_grants (
                id, job_id, grantee_id, token_hash, permission, granted_by,
                created_at, expires_at, revoked_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(grant.id.as_uuid())
        .bind(grant.job_id.as_uuid())
        .bind(grant.grantee().map(|id| id.as_uuid()))
        .bind(grant.token_hash())
        .bind(grant.permission.as_str())
        .bind(grant.granted_by.as_uuid())
        .bind(grant.created_at)
        .bind(grant.expires_at)
        .bind(grant.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to create share {}: {e}", grant.id)))?;
        Ok(())
    }

    async fn get(&self, id: ShareId) -> Result<Option<ShareGrant>> {
        let row = sqlx::query(&format!("SELECT {SHARE_COLUMNS} FROM share_grants WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("Failed to load share {id}: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ShareGrant>> {
        let rows = sqlx::query(&format!(
            "SELECT {SHARE_COLUMNS} FROM share_grants WHERE job_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to list shares for scan {job_id}: {e}")))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn revoke(
        &self,
        job_id: JobId,
        id: ShareId,
        now: DateTime<Utc>,
    ) -> Result<Option<ShareGrant>> {
        let row = sqlx::query(&format!(
            "UPDATE share_grants SET revoked_at = $3 \
             WHERE id = $1 AND job_id = $2 AND revoked_at IS NULL \
             RETURNING {SHARE_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to revoke share {id}: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }
}
