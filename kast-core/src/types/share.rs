//! Share grants and public links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{JobId, PrincipalId, ShareId};
use crate::error::ScanError;

/// Permission a grant carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePermission {
    /// Read access.
    View,
    /// Read and manage.
    Edit,
}

impl SharePermission {
    /// Lowercase name used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            SharePermission::View => "view",
            SharePermission::Edit => "edit",
        }
    }
}

impl fmt::Display for SharePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharePermission {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(SharePermission::View),
            "edit" => Ok(SharePermission::Edit),
            other => Err(ScanError::InvalidInput(format!(
                "unknown share permission '{other}'"
            ))),
        }
    }
}

/// Who a grant applies to. A grant is either bound to one principal or is a
/// public link identified by its token digest, never both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShareScope {
    /// Bound to one principal.
    Principal {
        /// The principal the job is shared with.
        grantee_id: PrincipalId,
    },
    /// Anyone presenting the matching token.
    PublicLink {
        /// Keyed digest of the token; the token itself is never stored.
        #[serde(skip_serializing)]
        token_hash: String,
    },
}

/// Access to one job given to a principal or through a public link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareGrant {
    /// Grant id.
    pub id: ShareId,
    /// Shared job.
    pub job_id: JobId,
    /// Who the grant is for.
    pub scope: ShareScope,
    /// What the grant allows.
    pub permission: SharePermission,
    /// Principal that created the grant.
    pub granted_by: PrincipalId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// `None` never expires. Public links always carry one.
    pub expires_at: Option<DateTime<Utc>>,
    /// Set by revocation. Revoked grants stay for the audit trail.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ShareGrant {
    /// A grant to `grantee_id`.
    pub fn for_principal(
        job_id: JobId,
        grantee_id: PrincipalId,
        permission: SharePermission,
        granted_by: PrincipalId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: ShareId::new(),
            job_id,
            scope: ShareScope::Principal { grantee_id },
            permission,
            granted_by,
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
        }
    }

    /// Public links are always view-only.
    pub fn public_link(
        job_id: JobId,
        token_hash: String,
        granted_by: PrincipalId,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ShareId::new(),
            job_id,
            scope: ShareScope::PublicLink { token_hash },
            permission: SharePermission::View,
            granted_by,
            created_at: Utc::now(),
            expires_at: Some(expires_at),
            revoked_at: None,
        }
    }

    /// The grantee of a principal grant.
    pub fn grantee(&self) -> Option<PrincipalId> {
        match &self.scope {
            ShareScope::Principal { grantee_id } => Some(*grantee_id),
            ShareScope::PublicLink { .. } => None,
        }
    }

    /// The digest of a public link token.
    pub fn token_hash(&self) -> Option<&str> {
        match &self.scope {
            ShareScope::Principal { .. } => None,
            ShareScope::PublicLink { token_hash } => Some(token_hash),
        }
    }

    /// A grant counts only while unrevoked and before its expiry instant.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|expiry| now < expiry)
    }
}
