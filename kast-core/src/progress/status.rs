//! Point-in-time view of a job: lifecycle status plus per-plugin progress.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::aggregator::ResultsAggregator;
use super::inference::{PluginObservation, PluginState};
use crate::error::Result;
use crate::types::{Disposition, JobId, JobStatus, ScanJob, SubTaskResult};

/// One plugin in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubTaskStatus {
    /// Plugin name.
    pub name: String,
    /// State inferred from the artifacts on disk.
    pub state: PluginState,
    /// Set once a result row exists.
    pub disposition: Option<Disposition>,
    /// Finding count from the result row.
    pub finding_count: Option<u32>,
    /// Error from the result row.
    pub error_detail: Option<String>,
    /// Modification time of the processed artifact behind the persisted row.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Counts over the sub-tasks in a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// All sub-tasks.
    pub total: u32,
    /// No artifact yet.
    pub pending: u32,
    /// Raw artifact only.
    pub in_progress: u32,
    /// Processed artifact present.
    pub completed: u32,
    /// Completed sub-tasks whose disposition is a failure.
    pub failed: u32,
    /// Sum of finding counts over recorded rows.
    pub findings: u64,
}

/// Built only from persisted rows and the artifact directory, so unchanged
/// inputs give identical snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Job the snapshot describes.
    pub job_id: JobId,
    /// Stored job status.
    pub status: JobStatus,
    /// Scan target.
    pub target: String,
    /// Error recorded on the job, if it failed.
    pub last_error: Option<String>,
    /// Requested or discovered plugins first, then rows whose artifacts are gone.
    pub subtasks: Vec<SubTaskStatus>,
    /// Counts over `subtasks`.
    pub summary: StatusSummary,
}

/// Builds [`StatusSnapshot`]s on demand.
#[derive(Clone, Debug)]
pub struct StatusService {
    aggregator: ResultsAggregator,
}

impl StatusService {
    /// Snapshots backed by `aggregator`.
    pub fn new(aggregator: ResultsAggregator) -> Self {
        Self { aggregator }
    }

    /// Infer plugin states, fold freshly completed artifacts into the
    /// results table, then merge the re-read rows. Never touches the job's
    /// own status.
    pub async fn snapshot(&self, job: &ScanJob) -> Result<StatusSnapshot> {
        let observations = self.aggregator.observe(job).await?;
        let known = self.aggregator.known_results(job).await?;

        // A failed pass may still have written rows before it stopped.
        let stale = match self
            .aggregator
            .aggregate_observed(job, &observations, &known)
            .await
        {
            Ok(report) => !report.upserted.is_empty(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "opportunistic aggregation failed");
                true
            }
        };

        let rows = if stale {
            self.aggregator.known_results(job).await?
        } else {
            known
        };

        Ok(merge(job, &observations, rows))
    }
}

fn merge(
    job: &ScanJob,
    observations: &[PluginObservation],
    mut rows: HashMap<String, SubTaskResult>,
) -> StatusSnapshot {
    let mut subtasks: Vec<SubTaskStatus> = observations
        .iter()
        .map(|observation| match rows.remove(&observation.name) {
            Some(row) => from_row(row),
            None => {
                // A processed artifact with no row could not be read yet; the
                // writer may be mid-flush.
                let state = match observation.state {
                    PluginState::Completed => PluginState::InProgress,
                    other => other,
                };
                SubTaskStatus {
                    name: observation.name.clone(),
                    state,
                    disposition: None,
                    finding_count: None,
                    error_detail: None,
                    completed_at: None,
                }
            }
        })
        .collect();

    // Rows whose artifacts are no longer on disk still count as completed.
    let mut leftovers: Vec<SubTaskResult> = rows.into_values().collect();
    leftovers.sort_by(|a, b| a.subtask.cmp(&b.subtask));
    subtasks.extend(leftovers.into_iter().map(from_row));

    let summary = summarize(&subtasks);
    StatusSnapshot {
        job_id: job.id,
        status: job.status,
        target: job.target.clone(),
        last_error: job.last_error.clone(),
        subtasks,
        summary,
    }
}

fn from_row(row: SubTaskResult) -> SubTaskStatus {
    SubTaskStatus {
        name: row.subtask,
        state: PluginState::Completed,
        disposition: Some(row.disposition),
        finding_count: Some(row.finding_count),
        error_detail: row.error_detail,
        completed_at: Some(row.observed_at),
    }
}

fn summarize(subtasks: &[SubTaskStatus]) -> StatusSummary {
    let mut summary = StatusSummary {
        total: subtasks.len() as u32,
        ..StatusSummary::default()
    };
    for subtask in subtasks {
        match subtask.state {
            PluginState::Pending => summary.pending += 1,
            PluginState::InProgress => summary.in_progress += 1,
            PluginState::Completed => {
                summary.completed += 1;
                if subtask.disposition == Some(Disposition::Failure) {
                    summary.failed += 1;
                }
            }
        }
        summary.findings += u64::from(subtask.finding_count.unwrap_or(0));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ScanUnitOfWork;
    use crate::artifacts::ArtifactLayout;
    use crate::config::{AggregatorConfig, ArtifactConfig};
    use crate::database::memory::MemoryStore;
    use crate::database::ports::SubTaskResultRepository;
    use crate::error::ScanError;
    use crate::progress::inference::PluginStateInferencer;
    use crate::types::{PrincipalId, ScanMode, ScanOptions};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Accepts the first `allowed` upserts, then fails every later one.
    struct FlakyResults {
        inner: MemoryStore,
        allowed: usize,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl SubTaskResultRepository for FlakyResults {
        async fn upsert(&self, result: &SubTaskResult) -> Result<()> {
            if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(ScanError::Storage("connection reset".into()));
            }
            self.inner.upsert(result).await
        }

        async fn list_for_job(&self, job_id: JobId) -> Result<Vec<SubTaskResult>> {
            self.inner.list_for_job(job_id).await
        }
    }

    struct Fixture {
        _tmp: TempDir,
        job: ScanJob,
        uow: ScanUnitOfWork,
        service: StatusService,
    }

    async fn fixture(plugins: &[&str]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = Arc::new(
            ArtifactLayout::new(&ArtifactConfig {
                results_root: tmp.path().to_path_buf(),
                ..ArtifactConfig::default()
            })
            .unwrap(),
        );
        let (uow, _store) = ScanUnitOfWork::in_memory();
        let job = ScanJob {
            id: JobId::new(),
            owner_id: PrincipalId::new(),
            target: "example.com".into(),
            mode: ScanMode::Passive,
            status: JobStatus::Running,
            plugins: plugins.iter().map(|p| p.to_string()).collect(),
            options: ScanOptions::default(),
            artifact_dir: tmp.path().join("job"),
            task_handle: None,
            rerun_of: None,
            transcript_path: None,
            exit_code: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        std::fs::create_dir_all(&job.artifact_dir).unwrap();
        uow.jobs.insert(&job).await.unwrap();

        let aggregator = ResultsAggregator::new(
            PluginStateInferencer::new(layout),
            uow.results.clone(),
            AggregatorConfig::default(),
        );
        Fixture {
            _tmp: tmp,
            job,
            uow,
            service: StatusService::new(aggregator),
        }
    }

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    fn states(snapshot: &StatusSnapshot) -> Vec<(&str, PluginState)> {
        snapshot
            .subtasks
            .iter()
            .map(|s| (s.name.as_str(), s.state))
            .collect()
    }

    #[tokio::test]
    async fn mid_run_snapshot_with_one_done_and_one_running() {
        let fx = fixture(&["A", "B"]).await;
        let dir = &fx.job.artifact_dir;
        write(dir, "A.json", "{}");
        write(dir, "A_processed.json", r#"{"findings": {"results": [1, 2, 3]}}"#);
        write(dir, "B.json", "{}");

        let snapshot = fx.service.snapshot(&fx.job).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(
            states(&snapshot),
            vec![("A", PluginState::Completed), ("B", PluginState::InProgress)]
        );
        assert_eq!(snapshot.subtasks[0].finding_count, Some(3));
        assert_eq!(
            snapshot.summary,
            StatusSummary {
                total: 2,
                pending: 0,
                in_progress: 1,
                completed: 1,
                failed: 0,
                findings: 3,
            }
        );

        let rows = fx.uow.results.list_for_job(fx.job.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subtask, "A");
    }

    #[tokio::test]
    async fn unparseable_artifact_without_row_reads_as_in_progress() {
        let fx = fixture(&["A", "B"]).await;
        let dir = &fx.job.artifact_dir;
        write(dir, "A.json", "{}");
        write(dir, "A_processed.json", "{\"findings\": {\"res");
        write(dir, "B.json", "{}");

        let snapshot = fx.service.snapshot(&fx.job).await.unwrap();
        assert_eq!(
            states(&snapshot),
            vec![("A", PluginState::InProgress), ("B", PluginState::InProgress)]
        );
        assert!(fx.uow.results.list_for_job(fx.job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persisted_row_is_never_reported_below_completed() {
        let fx = fixture(&["A"]).await;
        let dir = &fx.job.artifact_dir;
        write(dir, "A_processed.json", r#"{"error": "boom"}"#);
        let first = fx.service.snapshot(&fx.job).await.unwrap();
        assert_eq!(first.summary.failed, 1);

        // The tool rewrites the artifact and the read catches it half-written.
        write(dir, "A_processed.json", "{");
        let second = fx.service.snapshot(&fx.job).await.unwrap();
        assert_eq!(states(&second), vec![("A", PluginState::Completed)]);
        assert_eq!(second.subtasks[0].error_detail.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn repeated_snapshots_are_identical() {
        let fx = fixture(&[]).await;
        let dir = &fx.job.artifact_dir;
        write(dir, "subfinder.json", "{}");
        write(dir, "subfinder_processed.json", r#"{"findings": [1]}"#);
        write(dir, "wafw00f.json", "{}");
        write(dir, "kast_report.html", "<html></html>");

        let first = fx.service.snapshot(&fx.job).await.unwrap();
        let second = fx.service.snapshot(&fx.job).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.summary.total, 2);
        assert_eq!(fx.uow.results.list_for_job(fx.job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_job_without_directory_reports_requested_plugins_pending() {
        let fx = fixture(&["A", "B"]).await;
        std::fs::remove_dir_all(&fx.job.artifact_dir).unwrap();

        let snapshot = fx.service.snapshot(&fx.job).await.unwrap();
        assert_eq!(snapshot.summary.pending, 2);
        assert_eq!(snapshot.summary.total, 2);
    }

    #[tokio::test]
    async fn rows_written_before_a_failed_pass_are_reported() {
        let fx = fixture(&["A", "B"]).await;
        let dir = &fx.job.artifact_dir;
        write(dir, "A_processed.json", r#"{"findings": [1, 2]}"#);
        write(dir, "B_processed.json", r#"{"findings": [1]}"#);

        let tmp = TempDir::new().unwrap();
        let layout = Arc::new(
            ArtifactLayout::new(&ArtifactConfig {
                results_root: tmp.path().to_path_buf(),
                ..ArtifactConfig::default()
            })
            .unwrap(),
        );
        let results = Arc::new(FlakyResults {
            inner: MemoryStore::new(),
            allowed: 1,
            upserts: AtomicUsize::new(0),
        });
        let service = StatusService::new(ResultsAggregator::new(
            PluginStateInferencer::new(layout),
            results.clone(),
            AggregatorConfig::default(),
        ));

        let snapshot = service.snapshot(&fx.job).await.unwrap();
        assert_eq!(results.list_for_job(fx.job.id).await.unwrap().len(), 1);
        assert_eq!(snapshot.summary.completed, 1);
        assert_eq!(snapshot.summary.in_progress, 1);
        let completed: Vec<_> = snapshot
            .subtasks
            .iter()
            .filter(|s| s.state == PluginState::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].finding_count.is_some());
    }
}
