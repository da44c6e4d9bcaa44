//! Share grant storage port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{JobId, ShareGrant, ShareId};

/// Share grants and public links.
#[async_trait]
pub trait ShareGrantRepository: Send + Sync {
    /// Store a new grant.
    async fn insert(&self, grant: &ShareGrant) -> Result<()>;

    /// Fetch a grant by id, revoked or not.
    async fn get(&self, id: ShareId) -> Result<Option<ShareGrant>>;

    /// Every grant on a job, including revoked and expired ones, newest first.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ShareGrant>>;

    /// Set `revoked_at` if the grant is not already revoked. Returns the
    /// updated grant, or `None` when no unrevoked grant matched.
    async fn revoke(
        &self,
        job_id: JobId,
        id: ShareId,
        now: DateTime<Utc>,
    ) -> Result<Option<ShareGrant>>;
}
