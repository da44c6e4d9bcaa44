use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::Caller;
use super::crypto::{TokenHasher, digests_equal};
use crate::audit::{AuditService, scan_resource};
use crate::database::ports::{PrincipalRepository, ScanJobRepository, ShareGrantRepository};
use crate::error::{Result, ScanError};
use crate::types::{
    AuditAction, JobId, Principal, PrincipalRole, ScanJob, ShareGrant, SharePermission,
};

/// Effective access to one job. Ordered so callers can test
/// `level >= required`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// No access.
    None,
    /// Read the job, its status and report.
    View,
    /// Also rerun, delete, share and read the transcript.
    Edit,
}

impl From<SharePermission> for AccessLevel {
    fn from(permission: SharePermission) -> Self {
        match permission {
            SharePermission::View => AccessLevel::View,
            SharePermission::Edit => AccessLevel::Edit,
        }
    }
}

/// Resolve access in fixed priority order; the first rule that matches wins
/// and levels never combine.
///
/// 1. owner: edit
/// 2. admin: edit
/// 3. live grant to the principal: the grant's permission
/// 4. live public link whose digest matches `token_digest`: view
/// 5. otherwise none
///
/// `grants` are expected newest first, so among several live grants to the
/// same principal the newest applies.
pub fn resolve_access(
    job: &ScanJob,
    principal: Option<&Principal>,
    token_digest: Option<&str>,
    grants: &[ShareGrant],
    now: DateTime<Utc>,
) -> AccessLevel {
    if let Some(principal) = principal.filter(|p| p.is_active) {
        if job.is_owned_by(principal.id) {
            return AccessLevel::Edit;
        }
        if principal.is_admin() {
            return AccessLevel::Edit;
        }
        if let Some(grant) = grants.iter().find(|grant| {
            grant.job_id == job.id
                && grant.grantee() == Some(principal.id)
                && grant.is_live_at(now)
        }) {
            return grant.permission.into();
        }
    }

    if let Some(digest) = token_digest {
        let link_matches = grants.iter().any(|grant| {
            grant.job_id == job.id
                && grant.is_live_at(now)
                && grant
                    .token_hash()
                    .is_some_and(|stored| digests_equal(stored, digest))
        });
        if link_matches {
            return AccessLevel::View;
        }
    }

    AccessLevel::None
}

/// Loads the job and its grants and applies [`resolve_access`] against the
/// wall clock.
#[derive(Clone)]
pub struct AccessResolver {
    jobs: Arc<dyn ScanJobRepository>,
    shares: Arc<dyn ShareGrantRepository>,
    principals: Arc<dyn PrincipalRepository>,
    hasher: TokenHasher,
    audit: AuditService,
}

impl std::fmt::Debug for AccessResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessResolver")
            .field("jobs", &std::any::type_name_of_val(self.jobs.as_ref()))
            .field("shares", &std::any::type_name_of_val(self.shares.as_ref()))
            .finish_non_exhaustive()
    }
}

impl AccessResolver {
    /// Resolver over the job, share and principal ports.
    pub fn new(
        jobs: Arc<dyn ScanJobRepository>,
        shares: Arc<dyn ShareGrantRepository>,
        principals: Arc<dyn PrincipalRepository>,
        hasher: TokenHasher,
        audit: AuditService,
    ) -> Self {
        Self {
            jobs,
            shares,
            principals,
            hasher,
            audit,
        }
    }

    /// Hasher shared with the share service for link tokens.
    pub fn hasher(&self) -> &TokenHasher {
        &self.hasher
    }

    /// The job (if it exists) and the caller's effective level on it.
    pub async fn access(
        &self,
        job_id: JobId,
        caller: &Caller,
    ) -> Result<(Option<ScanJob>, AccessLevel)> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok((None, AccessLevel::None));
        };
        let grants = self.shares.list_for_job(job_id).await?;
        let digest = caller.share_token.as_deref().map(|token| self.hasher.hash(token));
        let level = resolve_access(
            &job,
            caller.principal.as_ref(),
            digest.as_deref(),
            &grants,
            Utc::now(),
        );
        Ok((Some(job), level))
    }

    /// Return the job when the caller holds at least `required`. A missing job
    /// and an insufficient grant both yield [`ScanError::Forbidden`].
    pub async fn require(
        &self,
        job_id: JobId,
        caller: &Caller,
        required: AccessLevel,
    ) -> Result<ScanJob> {
        let (job, level) = self.access(job_id, caller).await?;
        match job {
            Some(job) if level >= required => Ok(job),
            _ => {
                debug!(job_id = %job_id, ?required, ?level, "access denied");
                self.audit
                    .record(
                        caller.principal_id(),
                        AuditAction::AccessDenied,
                        scan_resource(job_id),
                        Some(format!("required {required:?}")),
                        &caller.origin,
                    )
                    .await;
                Err(ScanError::Forbidden)
            }
        }
    }

    /// Look up the active principal holding `api_key`.
    pub async fn authenticate(&self, api_key: &str) -> Result<Option<Principal>> {
        if api_key.is_empty() {
            return Ok(None);
        }
        self.principals
            .find_by_api_key_hash(&self.hasher.hash(api_key))
            .await
    }

    /// Provision a principal and return it with its API key. The key is not
    /// recoverable afterwards.
    pub async fn create_principal(
        &self,
        username: &str,
        role: PrincipalRole,
    ) -> Result<(Principal, String)> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ScanError::InvalidInput("username must not be empty".into()));
        }
        let principal = Principal::new(username, role);
        let api_key = TokenHasher::generate_token()?;
        self.principals
            .create(&principal, &self.hasher.hash(&api_key))
            .await?;
        Ok((principal, api_key))
    }
}
