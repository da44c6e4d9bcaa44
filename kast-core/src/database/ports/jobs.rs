//! Job storage port.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    JobFilter, JobId, JobPage, JobStats, JobStatus, PageRequest, PrincipalId,
    ScanJob, StatusTransition,
};

/// Storage for scan jobs.
#[async_trait]
pub trait ScanJobRepository: Send + Sync {
    /// Persist a new job. Implementations must reject a second active job
    /// with the same `rerun_of` with [`crate::ScanError::DispatchConflict`].
    async fn insert(&self, job: &ScanJob) -> Result<()>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Option<ScanJob>>;

    /// One page of jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter, page: PageRequest) -> Result<JobPage>;

    /// Every job currently in `status`. Used by startup recovery.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ScanJob>>;

    /// Whether an active job already re-runs `source`.
    async fn find_active_rerun(&self, source: JobId) -> Result<Option<ScanJob>>;

    /// The job whose artifacts live in `dir`, if any.
    async fn find_by_artifact_dir(&self, dir: &Path) -> Result<Option<ScanJob>>;

    /// Compare-and-set status change. Returns the updated job, or `None` when
    /// the stored status no longer equals `transition.from`. Steps that are
    /// not forward in the lifecycle fail with
    /// [`crate::ScanError::InvalidTransition`] before touching storage.
    async fn transition(
        &self,
        id: JobId,
        transition: &StatusTransition,
    ) -> Result<Option<ScanJob>>;

    /// Delete a job; results and grants go with it. Returns whether a row
    /// was removed.
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Per-status counts, optionally restricted to one owner.
    async fn stats(&self, owner: Option<PrincipalId>) -> Result<JobStats>;
}
