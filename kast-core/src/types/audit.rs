//! Audit trail records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AuditId, PrincipalId};

/// Action tags written to the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A scan was accepted.
    ScanDispatched,
    /// A finished scan was run again.
    ScanRerun,
    /// A scan and its artifacts were removed.
    ScanDeleted,
    /// A principal was given access to a scan.
    ShareCreated,
    /// A public link was minted.
    ShareLinkCreated,
    /// A grant or public link was revoked.
    ShareRevoked,
    /// A caller was refused access to a scan.
    AccessDenied,
    /// A CLI result directory was recorded as a scan.
    ScanImported,
    /// An import was refused.
    ScanImportFailed,
}

impl AuditAction {
    /// Tag stored in the `action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ScanDispatched => "scan_dispatched",
            AuditAction::ScanRerun => "scan_rerun",
            AuditAction::ScanDeleted => "scan_deleted",
            AuditAction::ShareCreated => "share_created",
            AuditAction::ShareLinkCreated => "share_link_created",
            AuditAction::ShareRevoked => "share_revoked",
            AuditAction::AccessDenied => "access_denied",
            AuditAction::ScanImported => "scan_imported",
            AuditAction::ScanImportFailed => "scan_import_failed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOrigin {
    /// Peer address of the request.
    pub client_addr: Option<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
}

/// One entry in the audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id.
    pub id: AuditId,
    /// `None` for anonymous callers.
    pub principal_id: Option<PrincipalId>,
    /// Stored as text so the trail can carry tags written by older releases.
    pub action: String,
    /// `kind:id`, e.g. `scan:0190...`.
    pub resource: String,
    /// Free-form detail, e.g. the share id.
    pub detail: Option<String>,
    /// Where the request came from.
    pub origin: AuditOrigin,
    /// When the action happened.
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// A record stamped with a fresh id and the current time.
    pub fn new(
        principal_id: Option<PrincipalId>,
        action: AuditAction,
        resource: impl Into<String>,
        detail: Option<String>,
        origin: AuditOrigin,
    ) -> Self {
        Self {
            id: AuditId::new(),
            principal_id,
            action: action.as_str().to_string(),
            resource: resource.into(),
            detail,
            origin,
            recorded_at: Utc::now(),
        }
    }
}
