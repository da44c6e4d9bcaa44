use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;

use sqlx::PgPool;

use crate::database::ports::{
    AuditRepository, PrincipalRepository, ScanJobRepository, ShareGrantRepository,
    SubTaskResultRepository,
};
use crate::database::postgres::{
    PostgresAuditRepository, PostgresPrincipalRepository, PostgresScanJobRepository,
    PostgresShareGrantRepository, PostgresSubTaskResultRepository,
};

/// Every repository port the services need, behind trait objects so the
/// Postgres and in-memory adapters are interchangeable.
#[derive(Clone)]
pub struct ScanUnitOfWork {
    /// Scan jobs.
    pub jobs: Arc<dyn ScanJobRepository>,
    /// Per-plugin result rows.
    pub results: Arc<dyn SubTaskResultRepository>,
    /// Grants and public links.
    pub shares: Arc<dyn ShareGrantRepository>,
    /// Audit trail.
    pub audit: Arc<dyn AuditRepository>,
    /// API principals.
    pub principals: Arc<dyn PrincipalRepository>,
}

impl fmt::Debug for ScanUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanUnitOfWork")
            .field("jobs", &type_name_of_val(self.jobs.as_ref()))
            .field("results", &type_name_of_val(self.results.as_ref()))
            .field("shares", &type_name_of_val(self.shares.as_ref()))
            .field("audit", &type_name_of_val(self.audit.as_ref()))
            .field("principals", &type_name_of_val(self.principals.as_ref()))
            .finish()
    }
}

impl ScanUnitOfWork {
    /// All ports backed by one Postgres pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresScanJobRepository::new(pool.clone())),
            results: Arc::new(PostgresSubTaskResultRepository::new(pool.clone())),
            shares: Arc::new(PostgresShareGrantRepository::new(pool.clone())),
            audit: Arc::new(PostgresAuditRepository::new(pool.clone())),
            principals: Arc::new(PostgresPrincipalRepository::new(pool)),
        }
    }

    /// All ports backed by one shared in-memory store.
    #[cfg(any(test, feature = "test-support"))]
    pub fn in_memory() -> (Self, crate::database::memory::MemoryStore) {
        let store = crate::database::memory::MemoryStore::new();
        let uow = Self {
            jobs: Arc::new(store.clone()),
            results: Arc::new(store.clone()),
            shares: Arc::new(store.clone()),
            audit: Arc::new(store.clone()),
            principals: Arc::new(store.clone()),
        };
        (uow, store)
    }
}
