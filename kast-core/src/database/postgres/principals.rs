use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgRow};

use super::column;
use crate::database::ports::PrincipalRepository;
use crate::error::{Result, ScanError};
use crate::types::{Principal, PrincipalId};

/// [`PrincipalRepository`] over the `principals` table.
#[derive(Debug, Clone)]
pub struct PostgresPrincipalRepository {
    pool: PgPool,
}

impl PostgresPrincipalRepository {
    /// Repository over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Principal> {
        let role: String = column(row, "role")?;
        Ok(Principal {
            id: PrincipalId(column(row, "id")?),
            username: column(row, "username")?,
            role: role.parse()?,
            is_active: column(row, "is_active")?,
            created_at: column(row, "created_at")?,
        })
    }
}

#[async_trait]
impl PrincipalRepository for PostgresPrincipalRepository {
    async fn create(&self, principal: &Principal, api_key_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (id, username, role, is_active, api_key_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(principal.id.as_uuid())
        .bind(&principal.username)
        .bind(principal.role.as_str())
        .bind(principal.is_active)
        .bind(api_key_hash)
        .bind(principal.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ScanError::Storage(format!(
                "Failed to create principal '{}': {e}",
                principal.username
            ))
        })?;
        Ok(())
    }

    async fn get(&self, id: PrincipalId) -> Result<Option<Principal>> {
        let row = sqlx::query(
            "SELECT id, username, role, is_active, created_at FROM principals WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to load principal {id}: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Principal>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, role, is_active, created_at
            FROM principals
            WHERE api_key_hash = $1 AND is_active
            "#,
        )
        .bind(api_key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Storage(format!("Failed to authenticate principal: {e}")))?;

        row.as_ref().map(Self::map_row).transpose()
    }
}
