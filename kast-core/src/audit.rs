//! Append-only audit trail with retention pruning.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::database::ports::AuditRepository;
use crate::error::Result;
use crate::types::{AuditAction, AuditOrigin, AuditRecord, JobId, PrincipalId};

/// Resource tag used for scan audit records.
pub fn scan_resource(id: JobId) -> String {
    format!("scan:{id}")
}

/// Writes and reads the audit trail.
#[derive(Clone)]
pub struct AuditService {
    repo: Arc<dyn AuditRepository>,
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("repo", &std::any::type_name_of_val(self.repo.as_ref()))
            .finish()
    }
}

impl AuditService {
    /// Service over `repo`.
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    /// Append a record. A failed write is logged and does not fail the
    /// operation being audited.
    pub async fn record(
        &self,
        principal: Option<PrincipalId>,
        action: AuditAction,
        resource: impl Into<String>,
        detail: Option<String>,
        origin: &AuditOrigin,
    ) {
        let record = AuditRecord::new(principal, action, resource, detail, origin.clone());
        if let Err(e) = self.repo.append(&record).await {
            warn!(
                action = %action,
                resource = %record.resource,
                error = %e,
                "failed to write audit record"
            );
        }
    }

    /// Newest records first. `limit` is clamped to 1..=1000.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        self.repo.recent(limit.clamp(1, 1000)).await
    }

    /// Remove records older than `retention` as of `now`.
    pub async fn prune(&self, retention: Duration, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.repo.prune_older_than(now - retention).await?;
        if removed > 0 {
            info!(removed, retention_days = retention.num_days(), "pruned audit records");
        }
        Ok(removed)
    }
}
