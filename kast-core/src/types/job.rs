//! Scan jobs and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::ids::{JobId, PrincipalId};
use crate::error::ScanError;

/// Scan intensity passed through to the external tool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Reconnaissance plugins only.
    #[default]
    Passive,
    /// Also plugins that send attack traffic.
    Active,
}

impl ScanMode {
    /// Lowercase name used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Passive => "passive",
            ScanMode::Active => "active",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passive" => Ok(ScanMode::Passive),
            "active" => Ok(ScanMode::Active),
            other => Err(ScanError::InvalidInput(format!(
                "unknown scan mode '{other}'"
            ))),
        }
    }
}

/// Job lifecycle. Transitions only ever move forward:
/// `Pending -> Running -> {Completed, Failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not yet claimed.
    Pending,
    /// Claimed by a worker; the tool is running.
    Running,
    /// The tool exited cleanly.
    Completed,
    /// Exited non-zero, timed out or interrupted.
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Lowercase name used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Pending and running jobs hold the job's single dispatch slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// The forward-only lifecycle table every repository enforces.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ScanError::InvalidInput(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Optional knobs forwarded to the external tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Run plugins in parallel inside the tool.
    pub parallel: bool,
    /// Worker cap for parallel mode; ignored unless `parallel` is set.
    pub max_workers: Option<u16>,
    /// Pass `-v` to the tool.
    pub verbose: bool,
    /// Ask the tool to plan without running plugins.
    pub dry_run: bool,
}

/// Persisted job metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    /// Job id.
    pub id: JobId,
    /// Principal that submitted the scan.
    pub owner_id: PrincipalId,
    /// Scan target.
    pub target: String,
    /// Scan mode.
    pub mode: ScanMode,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Requested plugins; empty means "discover from artifacts".
    pub plugins: Vec<String>,
    /// Flags for the tool.
    pub options: ScanOptions,
    /// Allocated at submission; the tool writes nothing outside it.
    pub artifact_dir: PathBuf,
    /// Handle of the run that claimed the job; `None` until claimed.
    pub task_handle: Option<String>,
    /// The job this one re-runs, if any.
    pub rerun_of: Option<JobId>,
    /// Set once the run finishes.
    pub transcript_path: Option<PathBuf>,
    /// `None` when the run timed out or was killed.
    pub exit_code: Option<i32>,
    /// Why the job failed.
    pub last_error: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Set on the claim.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    /// Wall time of the run, once it has ended.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// True when `principal` submitted the job.
    pub fn is_owned_by(&self, principal: PrincipalId) -> bool {
        self.owner_id == principal
    }
}

/// A single compare-and-set status change. Repositories apply it only when the
/// stored status still equals `from`.
#[derive(Clone, Debug)]
pub struct StatusTransition {
    /// Status the job must still be in.
    pub from: JobStatus,
    /// Status to move to.
    pub to: JobStatus,
    /// Recorded as `started_at` or `completed_at` depending on `to`.
    pub at: DateTime<Utc>,
    /// Recorded as `last_error`.
    pub error: Option<String>,
    /// Tool exit code.
    pub exit_code: Option<i32>,
    /// Transcript written by the run.
    pub transcript_path: Option<PathBuf>,
    /// Identifier of the run that claimed the job. Only recorded when
    /// entering `Running`.
    pub task_handle: Option<String>,
}

impl StatusTransition {
    /// A bare transition; attach outcome details with the `with_*` builders.
    pub fn new(from: JobStatus, to: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            error: None,
            exit_code: None,
            transcript_path: None,
            task_handle: None,
        }
    }

    /// Fails with [`ScanError::InvalidTransition`] unless `from -> to` is a
    /// forward step of the lifecycle.
    pub fn ensure_forward(&self, job_id: JobId) -> Result<(), ScanError> {
        if self.from.can_transition_to(self.to) {
            Ok(())
        } else {
            Err(ScanError::InvalidTransition {
                job_id,
                from: self.from,
                to: self.to,
            })
        }
    }

    /// Record the handle of the run claiming the job.
    pub fn with_task_handle(mut self, handle: impl Into<String>) -> Self {
        self.task_handle = Some(handle.into());
        self
    }

    /// Attach the failure reason.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the tool's exit code.
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Attach the transcript path.
    pub fn with_transcript(mut self, path: Option<PathBuf>) -> Self {
        self.transcript_path = path;
        self
    }
}

/// Listing filter; `owner` restricts to a principal's own jobs.
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    /// Only jobs owned by this principal.
    pub owner: Option<PrincipalId>,
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Substring match on the target.
    pub target_contains: Option<String>,
}

impl JobFilter {
    /// True when `job` passes every set criterion.
    pub fn matches(&self, job: &ScanJob) -> bool {
        self.owner.is_none_or(|owner| job.owner_id == owner)
            && self.status.is_none_or(|status| job.status == status)
            && self
                .target_contains
                .as_deref()
                .is_none_or(|needle| job.target.contains(needle))
    }
}

/// 1-based page selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Page number, starting at 1.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
}

impl PageRequest {
    /// Page size when none is requested.
    pub const DEFAULT_PER_PAGE: u32 = 20;
    /// Largest accepted page size.
    pub const MAX_PER_PAGE: u32 = 100;

    /// Clamp to sane bounds: pages are 1-based, page size is capped.
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page
                .unwrap_or(Self::DEFAULT_PER_PAGE)
                .clamp(1, Self::MAX_PER_PAGE),
        }
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of jobs and the total match count.
#[derive(Clone, Debug, Serialize)]
pub struct JobPage {
    /// Jobs on this page.
    pub jobs: Vec<ScanJob>,
    /// Jobs matching the filter across all pages.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
}

impl JobPage {
    /// Page count for `total`. Zero when nothing matched.
    pub fn pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.per_page.max(1)))
    }
}

/// Per-status job counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// All jobs.
    pub total: u64,
    /// Jobs waiting for a worker.
    pub pending: u64,
    /// Jobs with the tool running.
    pub running: u64,
    /// Jobs that finished cleanly.
    pub completed: u64,
    /// Jobs that failed.
    pub failed: u64,
}

impl JobStats {
    /// Add `count` jobs in `status`.
    pub fn record(&mut self, status: JobStatus, count: u64) {
        self.total += count;
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
