//! Read and delete operations over existing scans.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::access::{AccessLevel, AccessResolver, Caller};
use crate::artifacts::ArtifactLayout;
use crate::audit::{AuditService, scan_resource};
use crate::database::ports::{ScanJobRepository, SubTaskResultRepository};
use crate::error::{Result, ScanError};
use crate::types::{
    AuditAction, JobFilter, JobId, JobPage, JobStats, PageRequest, ScanJob, SubTaskResult,
};

/// A job with its persisted per-plugin rows and the caller's access level.
#[derive(Clone, Debug, Serialize)]
pub struct ScanDetail {
    /// The stored job.
    pub job: ScanJob,
    /// Rows recorded so far, one per finished plugin.
    pub results: Vec<SubTaskResult>,
    /// What the caller may do with the job.
    pub access: AccessLevel,
}

/// Access-checked reads over stored scans, plus deletion.
#[derive(Clone)]
pub struct ScanCatalog {
    jobs: Arc<dyn ScanJobRepository>,
    results: Arc<dyn SubTaskResultRepository>,
    access: AccessResolver,
    audit: AuditService,
    layout: Arc<ArtifactLayout>,
}

impl std::fmt::Debug for ScanCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCatalog")
            .field("jobs", &std::any::type_name_of_val(self.jobs.as_ref()))
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ScanCatalog {
    /// Wire the service to its collaborators.
    pub fn new(
        jobs: Arc<dyn ScanJobRepository>,
        results: Arc<dyn SubTaskResultRepository>,
        access: AccessResolver,
        audit: AuditService,
        layout: Arc<ArtifactLayout>,
    ) -> Self {
        Self {
            jobs,
            results,
            access,
            audit,
            layout,
        }
    }

    /// Admins see every job; other principals see the jobs they own.
    /// Shared jobs are reached by id, not through the listing.
    pub async fn list(
        &self,
        caller: &Caller,
        mut filter: JobFilter,
        page: PageRequest,
    ) -> Result<JobPage> {
        let principal = caller.principal_id().ok_or(ScanError::Forbidden)?;
        filter.owner = (!caller.is_admin()).then_some(principal);
        self.jobs.list(&filter, page).await
    }

    /// Counts over the caller's own jobs; admins see every job.
    pub async fn stats(&self, caller: &Caller) -> Result<JobStats> {
        let principal = caller.principal_id().ok_or(ScanError::Forbidden)?;
        let owner = (!caller.is_admin()).then_some(principal);
        self.jobs.stats(owner).await
    }

    /// The job and its sub-task rows. Needs view access.
    pub async fn detail(&self, caller: &Caller, job_id: JobId) -> Result<ScanDetail> {
        let (job, level) = self.access.access(job_id, caller).await?;
        let job = match job {
            Some(job) if level >= AccessLevel::View => job,
            _ => {
                // Repeat through `require` so the denial is audited.
                self.access.require(job_id, caller, AccessLevel::View).await?
            }
        };
        let results = self.results.list_for_job(job.id).await?;
        Ok(ScanDetail {
            job,
            results,
            access: level,
        })
    }

    /// Delete a finished job with its results and grants. Artifacts under the
    /// results root are removed as well; a failure there is only logged.
    pub async fn delete(&self, caller: &Caller, job_id: JobId) -> Result<ScanJob> {
        let job = self.access.require(job_id, caller, AccessLevel::Edit).await?;
        if job.status.is_active() {
            return Err(ScanError::DispatchConflict {
                job_id: job.id,
                status: job.status,
            });
        }

        if !self.jobs.delete(job.id).await? {
            return Err(ScanError::NotFound(format!("scan {job_id}")));
        }
        info!(job_id = %job.id, "scan deleted");
        self.audit
            .record(
                caller.principal_id(),
                AuditAction::ScanDeleted,
                scan_resource(job.id),
                Some(format!("target={}", job.target)),
                &caller.origin,
            )
            .await;

        self.remove_artifacts(&job).await;
        Ok(job)
    }

    /// Path of the tool's HTML report, once it exists.
    pub async fn report_path(&self, caller: &Caller, job_id: JobId) -> Result<PathBuf> {
        let job = self.access.require(job_id, caller, AccessLevel::View).await?;
        let path = self.layout.report_path(&job.artifact_dir);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(ScanError::NotFound(format!("report for scan {job_id}"))),
        }
    }

    /// The execution transcript may echo tool output verbatim, so it is
    /// limited to callers who can edit the job.
    pub async fn transcript_path(&self, caller: &Caller, job_id: JobId) -> Result<PathBuf> {
        let job = self.access.require(job_id, caller, AccessLevel::Edit).await?;
        let path = job
            .transcript_path
            .ok_or_else(|| ScanError::NotFound(format!("transcript for scan {job_id}")))?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(ScanError::NotFound(format!("transcript for scan {job_id}"))),
        }
    }

    async fn remove_artifacts(&self, job: &ScanJob) {
        let root = self.layout.results_root();
        if !job.artifact_dir.starts_with(root) || job.artifact_dir == root {
            warn!(
                job_id = %job.id,
                dir = %job.artifact_dir.display(),
                "artifact directory outside results root; leaving it in place"
            );
            return;
        }
        match tokio::fs::remove_dir_all(&job.artifact_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    dir = %job.artifact_dir.display(),
                    error = %e,
                    "failed to remove scan artifacts"
                );
            }
        }
    }
}
