use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use super::resolver::{AccessLevel, AccessResolver};
use super::{Caller, TokenHasher};
use crate::audit::{AuditService, scan_resource};
use crate::database::ports::{PrincipalRepository, ShareGrantRepository};
use crate::error::{Result, ScanError};
use crate::types::{
    AuditAction, JobId, PrincipalId, ShareGrant, ShareId, SharePermission,
};

/// A freshly created public link. `token` is shown to the creator once and
/// is never stored.
#[derive(Clone, Debug, Serialize)]
pub struct CreatedLink {
    /// The stored grant; carries only the token digest.
    pub grant: ShareGrant,
    /// Raw token. Shown once, never stored.
    pub token: String,
}

/// Creates, lists and revokes grants. Every operation needs edit access to the job.
#[derive(Clone)]
pub struct ShareService {
    access: AccessResolver,
    shares: Arc<dyn ShareGrantRepository>,
    principals: Arc<dyn PrincipalRepository>,
    audit: AuditService,
}

impl std::fmt::Debug for ShareService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareService")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl ShareService {
    /// Longest lifetime a public link may be created with.
    pub const MAX_LINK_LIFETIME_DAYS: i64 = 30;

    /// Wire the service to its collaborators.
    pub fn new(
        access: AccessResolver,
        shares: Arc<dyn ShareGrantRepository>,
        principals: Arc<dyn PrincipalRepository>,
        audit: AuditService,
    ) -> Self {
        Self {
            access,
            shares,
            principals,
            audit,
        }
    }

    /// Grant `grantee_id` access to a job. Granting to the owner is rejected.
    pub async fn share_with_principal(
        &self,
        caller: &Caller,
        job_id: JobId,
        grantee_id: PrincipalId,
        permission: SharePermission,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ShareGrant> {
        let job = self.access.require(job_id, caller, AccessLevel::Edit).await?;
        let granted_by = caller.principal_id().ok_or(ScanError::Forbidden)?;

        if expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
            return Err(ScanError::InvalidInput(
                "expires_at must be in the future".into(),
            ));
        }
        if job.is_owned_by(grantee_id) {
            return Err(ScanError::InvalidInput(
                "the owner already has full access".into(),
            ));
        }
        if self.principals.get(grantee_id).await?.is_none() {
            return Err(ScanError::InvalidInput(format!(
                "unknown grantee {grantee_id}"
            )));
        }

        let grant =
            ShareGrant::for_principal(job_id, grantee_id, permission, granted_by, expires_at);
        self.shares.insert(&grant).await?;

        info!(
            job_id = %job_id,
            share_id = %grant.id,
            grantee = %grantee_id,
            %permission,
            "scan shared"
        );
        self.audit
            .record(
                Some(granted_by),
                AuditAction::ShareCreated,
                scan_resource(job_id),
                Some(format!("grantee={grantee_id} permission={permission}")),
                &caller.origin,
            )
            .await;
        Ok(grant)
    }

    /// Create a view-only public link valid for `lifetime`.
    pub async fn create_public_link(
        &self,
        caller: &Caller,
        job_id: JobId,
        lifetime: Duration,
    ) -> Result<CreatedLink> {
        self.access.require(job_id, caller, AccessLevel::Edit).await?;
        let granted_by = caller.principal_id().ok_or(ScanError::Forbidden)?;

        if lifetime < Duration::seconds(1)
            || lifetime > Duration::days(Self::MAX_LINK_LIFETIME_DAYS)
        {
            return Err(ScanError::InvalidInput(format!(
                "link lifetime must be between 1 second and {} days",
                Self::MAX_LINK_LIFETIME_DAYS
            )));
        }

        let token = TokenHasher::generate_token()?;
        let expires_at = Utc::now() + lifetime;
        let grant = ShareGrant::public_link(
            job_id,
            self.access.hasher().hash(&token),
            granted_by,
            expires_at,
        );
        self.shares.insert(&grant).await?;

        info!(job_id = %job_id, share_id = %grant.id, %expires_at, "public link created");
        self.audit
            .record(
                Some(granted_by),
                AuditAction::ShareLinkCreated,
                scan_resource(job_id),
                Some(format!("share={} expires_at={expires_at}", grant.id)),
                &caller.origin,
            )
            .await;
        Ok(CreatedLink { grant, token })
    }

    /// Mark a grant revoked. Unknown grants are `NotFound`.
    pub async fn revoke(
        &self,
        caller: &Caller,
        job_id: JobId,
        share_id: ShareId,
    ) -> Result<ShareGrant> {
        self.access.require(job_id, caller, AccessLevel::Edit).await?;
        let revoked = self
            .shares
            .revoke(job_id, share_id, Utc::now())
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("share {share_id}")))?;

        info!(job_id = %job_id, share_id = %share_id, "share revoked");
        self.audit
            .record(
                caller.principal_id(),
                AuditAction::ShareRevoked,
                scan_resource(job_id),
                Some(format!("share={share_id}")),
                &caller.origin,
            )
            .await;
        Ok(revoked)
    }

    /// Every grant on the job, including expired and revoked ones.
    pub async fn list(&self, caller: &Caller, job_id: JobId) -> Result<Vec<ShareGrant>> {
        self.access.require(job_id, caller, AccessLevel::Edit).await?;
        self.shares.list_for_job(job_id).await
    }
}
