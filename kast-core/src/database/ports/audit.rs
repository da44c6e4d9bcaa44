//! Audit storage port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::AuditRecord;

/// Append-only store for audit records.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Store one record.
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Most recent records first.
    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>>;

    /// Delete records older than `cutoff`, returning the number removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
