use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use super::pool::JobQueue;
use super::request::NewScan;
use crate::access::{AccessLevel, AccessResolver, Caller};
use crate::artifacts::ArtifactLayout;
use crate::audit::{AuditService, scan_resource};
use crate::database::ports::ScanJobRepository;
use crate::error::{Result, ScanError};
use crate::types::{AuditAction, JobId, JobStatus, PrincipalId, ScanJob, StatusTransition};

const INTERRUPTED: &str = "interrupted: the server stopped while the scan was running";

/// What [`JobDispatcher::recover`] did at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending jobs put back on the queue.
    pub requeued: Vec<JobId>,
    /// Running jobs marked failed.
    pub interrupted: Vec<JobId>,
}

/// Admission control and enqueueing. Creates jobs in `pending`; everything
/// after that belongs to the worker that claims the job.
#[derive(Clone)]
pub struct JobDispatcher {
    jobs: Arc<dyn ScanJobRepository>,
    layout: Arc<ArtifactLayout>,
    access: AccessResolver,
    audit: AuditService,
    queue: JobQueue,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("jobs", &std::any::type_name_of_val(self.jobs.as_ref()))
            .field("layout", &self.layout)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    /// Wire the service to its collaborators.
    pub fn new(
        jobs: Arc<dyn ScanJobRepository>,
        layout: Arc<ArtifactLayout>,
        access: AccessResolver,
        audit: AuditService,
        queue: JobQueue,
    ) -> Self {
        Self {
            jobs,
            layout,
            access,
            audit,
            queue,
        }
    }

    /// Create a pending job owned by the calling principal and queue it.
    pub async fn submit(&self, caller: &Caller, scan: NewScan) -> Result<ScanJob> {
        let owner = caller.principal_id().ok_or(ScanError::Forbidden)?;
        let scan = scan.validated()?;

        let job = self.pending_job(owner, scan, None);
        self.jobs.insert(&job).await?;
        info!(
            job_id = %job.id,
            target = %job.target,
            mode = %job.mode,
            plugins = job.plugins.len(),
            "scan submitted"
        );
        self.audit
            .record(
                Some(owner),
                AuditAction::ScanDispatched,
                scan_resource(job.id),
                Some(format!("target={} mode={}", job.target, job.mode)),
                &caller.origin,
            )
            .await;

        self.enqueue(job).await
    }

    /// Queue a fresh job with the source job's configuration.
    ///
    /// Rejected with [`ScanError::DispatchConflict`] while the source or an
    /// earlier re-run of it is still pending or running. The source job is
    /// never modified.
    pub async fn rerun(&self, caller: &Caller, source_id: JobId) -> Result<ScanJob> {
        let source = self
            .access
            .require(source_id, caller, AccessLevel::Edit)
            .await?;
        let owner = caller.principal_id().ok_or(ScanError::Forbidden)?;

        if source.status.is_active() {
            return Err(ScanError::DispatchConflict {
                job_id: source.id,
                status: source.status,
            });
        }
        if let Some(active) = self.jobs.find_active_rerun(source.id).await? {
            return Err(ScanError::DispatchConflict {
                job_id: active.id,
                status: active.status,
            });
        }

        let scan = NewScan {
            target: source.target.clone(),
            mode: source.mode,
            plugins: source.plugins.clone(),
            options: source.options.clone(),
        };
        let job = self.pending_job(owner, scan, Some(source.id));
        // The repository enforces one active re-run per source, so a racing
        // request fails here with a conflict.
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, rerun_of = %source.id, "scan re-run submitted");
        self.audit
            .record(
                Some(owner),
                AuditAction::ScanRerun,
                scan_resource(source.id),
                Some(format!("new_scan={}", job.id)),
                &caller.origin,
            )
            .await;

        self.enqueue(job).await
    }

    /// Reconcile jobs a previous process left behind: pending jobs are queued
    /// again and running jobs are failed. Call once the pool is started.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for job in self.jobs.list_by_status(JobStatus::Running).await? {
            let transition =
                StatusTransition::new(JobStatus::Running, JobStatus::Failed, Utc::now())
                    .with_error(INTERRUPTED);
            if self.jobs.transition(job.id, &transition).await?.is_some() {
                warn!(job_id = %job.id, "marked interrupted scan as failed");
                report.interrupted.push(job.id);
            }
        }

        for job in self.jobs.list_by_status(JobStatus::Pending).await? {
            self.queue.enqueue(job.id).await?;
            report.requeued.push(job.id);
        }

        if !report.requeued.is_empty() || !report.interrupted.is_empty() {
            info!(
                requeued = report.requeued.len(),
                interrupted = report.interrupted.len(),
                "recovered scans from previous run"
            );
        }
        Ok(report)
    }

    fn pending_job(
        &self,
        owner: PrincipalId,
        scan: NewScan,
        rerun_of: Option<JobId>,
    ) -> ScanJob {
        let id = JobId::new();
        let now = Utc::now();
        ScanJob {
            id,
            owner_id: owner,
            artifact_dir: self.layout.allocate_dir(&scan.target, id, now),
            target: scan.target,
            mode: scan.mode,
            status: JobStatus::Pending,
            plugins: scan.plugins,
            options: scan.options,
            task_handle: None,
            rerun_of,
            transcript_path: None,
            exit_code: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A job that cannot be queued would stay pending forever, so it is
    /// walked through `running` to `failed` before the error is returned.
    async fn enqueue(&self, job: ScanJob) -> Result<ScanJob> {
        let Err(e) = self.queue.enqueue(job.id).await else {
            return Ok(job);
        };
        error!(job_id = %job.id, error = %e, "failed to queue scan");

        let now = Utc::now();
        let claim = StatusTransition::new(JobStatus::Pending, JobStatus::Running, now);
        if self.jobs.transition(job.id, &claim).await?.is_some() {
            let fail = StatusTransition::new(JobStatus::Running, JobStatus::Failed, now)
                .with_error(e.to_string());
            self.jobs.transition(job.id, &fail).await?;
        }
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TokenHasher;
    use crate::application::ScanUnitOfWork;
    use crate::config::{AggregatorConfig, ArtifactConfig, DispatcherConfig};
    use crate::dispatch::pool::{JobRunner, WorkerPool};
    use crate::execution::{
        ExecutionDisposition, ExecutionOutcome, ExecutionRequest, PluginInfo, ScanExecutor,
    };
    use crate::progress::{PluginStateInferencer, ResultsAggregator};
    use crate::types::{Principal, PrincipalRole, ScanMode, ScanOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    /// Writes a processed artifact per requested plugin and returns a fixed
    /// outcome. Each run waits for one permit from `gate`.
    struct FakeExecutor {
        gate: Semaphore,
        disposition: ExecutionDisposition,
        fail_to_spawn: bool,
        calls: AtomicUsize,
    }

    impl FakeExecutor {
        fn open(disposition: ExecutionDisposition) -> Self {
            Self {
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                disposition,
                fail_to_spawn: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn gated() -> Self {
            Self {
                gate: Semaphore::new(0),
                ..Self::open(ExecutionDisposition::Success)
            }
        }
    }

    #[async_trait]
    impl ScanExecutor for FakeExecutor {
        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            if self.fail_to_spawn {
                return Err(ScanError::Execution("No such file or directory".into()));
            }
            tokio::fs::create_dir_all(&request.output_dir).await?;
            for plugin in &request.plugins {
                tokio::fs::write(
                    request.output_dir.join(format!("{plugin}_processed.json")),
                    r#"{"findings": {"results": [1, 2]}}"#,
                )
                .await?;
            }
            let (exit_code, stderr_tail) = match self.disposition {
                ExecutionDisposition::Success => (Some(0), String::new()),
                ExecutionDisposition::Failure => (Some(2), "target unreachable".to_string()),
                ExecutionDisposition::Timeout => (None, String::new()),
            };
            Ok(ExecutionOutcome {
                disposition: self.disposition,
                exit_code,
                transcript_path: Some(request.output_dir.join("kast_execution.log")),
                stderr_tail,
            })
        }

        async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        tmp: TempDir,
        uow: ScanUnitOfWork,
        access: AccessResolver,
        runner: JobRunner,
        dispatcher: JobDispatcher,
        pool: Option<WorkerPool>,
    }

    impl Fixture {
        async fn user(&self, name: &str) -> Principal {
            self.access
                .create_principal(name, PrincipalRole::User)
                .await
                .unwrap()
                .0
        }

        async fn wait_for(&self, id: JobId, status: JobStatus) -> ScanJob {
            for _ in 0..500 {
                let job = self.uow.jobs.get(id).await.unwrap().unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("scan {id} never reached {status}");
        }
    }

    fn fixture(executor: Arc<FakeExecutor>, start_pool: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = Arc::new(
            ArtifactLayout::new(&ArtifactConfig {
                results_root: tmp.path().to_path_buf(),
                ..ArtifactConfig::default()
            })
            .unwrap(),
        );
        let (uow, _store) = ScanUnitOfWork::in_memory();
        let audit = AuditService::new(uow.audit.clone());
        let access = AccessResolver::new(
            uow.jobs.clone(),
            uow.shares.clone(),
            uow.principals.clone(),
            TokenHasher::new("test-key").unwrap(),
            audit.clone(),
        );
        let aggregator = ResultsAggregator::new(
            PluginStateInferencer::new(Arc::clone(&layout)),
            uow.results.clone(),
            AggregatorConfig::default(),
        );
        let runner = JobRunner::new(
            uow.jobs.clone(),
            executor,
            aggregator,
            Duration::from_secs(60),
        );

        let config = DispatcherConfig {
            workers: 2,
            queue_capacity: 16,
            ..DispatcherConfig::default()
        };
        let (pool, queue) = if start_pool {
            let pool = WorkerPool::start(runner.clone(), &config, CancellationToken::new());
            let queue = pool.queue();
            (Some(pool), queue)
        } else {
            (None, JobQueue::closed())
        };

        let dispatcher = JobDispatcher::new(uow.jobs.clone(), layout, access.clone(), audit, queue);
        Fixture {
            tmp,
            uow,
            access,
            runner,
            dispatcher,
            pool,
        }
    }

    #[tokio::test]
    async fn submitted_scan_runs_to_completion_and_is_aggregated() {
        let fx = fixture(Arc::new(FakeExecutor::open(ExecutionDisposition::Success)), true);
        let owner = fx.user("owner").await;
        let caller = Caller::principal(owner.clone());

        let job = fx
            .dispatcher
            .submit(
                &caller,
                NewScan::new("example.com", ScanMode::Passive).with_plugins(["A", "B"]),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.owner_id, owner.id);
        assert!(job.task_handle.is_none());
        assert!(job.artifact_dir.starts_with(fx.tmp.path()));

        let done = fx.wait_for(job.id, JobStatus::Completed).await;
        assert_eq!(done.exit_code, Some(0));
        assert!(done.task_handle.as_deref().is_some_and(|h| h.starts_with("run-")));
        assert_eq!(done.artifact_dir, job.artifact_dir);
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        assert!(done.transcript_path.is_some());

        // The final aggregation pass runs before the worker frees up, so
        // poll briefly for the rows.
        for _ in 0..100 {
            if fx.uow.results.list_for_job(job.id).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let rows = fx.uow.results.list_for_job(job.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.finding_count == 2));

        if let Some(pool) = fx.pool {
            pool.shutdown(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test]
    async fn rerun_conflicts_while_source_or_previous_rerun_is_active() {
        let executor = Arc::new(FakeExecutor::gated());
        let fx = fixture(Arc::clone(&executor), true);
        let owner = fx.user("owner").await;
        let caller = Caller::principal(owner);

        let job = fx
            .dispatcher
            .submit(&caller, NewScan::new("example.com", ScanMode::Active))
            .await
            .unwrap();
        fx.wait_for(job.id, JobStatus::Running).await;

        let conflict = fx.dispatcher.rerun(&caller, job.id).await;
        assert!(matches!(
            conflict,
            Err(ScanError::DispatchConflict { status: JobStatus::Running, .. })
        ));

        executor.gate.add_permits(1);
        fx.wait_for(job.id, JobStatus::Completed).await;

        let rerun = fx.dispatcher.rerun(&caller, job.id).await.unwrap();
        assert_eq!(rerun.rerun_of, Some(job.id));
        assert_eq!(rerun.target, "example.com");
        assert_eq!(rerun.mode, ScanMode::Active);
        assert_ne!(rerun.artifact_dir, job.artifact_dir);

        let second = fx.dispatcher.rerun(&caller, job.id).await;
        assert!(matches!(second, Err(ScanError::DispatchConflict { .. })));

        // History is untouched.
        let source = fx.uow.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(source.status, JobStatus::Completed);

        executor.gate.add_permits(1);
        fx.wait_for(rerun.id, JobStatus::Completed).await;
        assert!(fx.dispatcher.rerun(&caller, job.id).await.is_ok());
        executor.gate.add_permits(1);

        if let Some(pool) = fx.pool {
            pool.shutdown(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test]
    async fn rerun_requires_edit_access() {
        let fx = fixture(Arc::new(FakeExecutor::open(ExecutionDisposition::Success)), true);
        let owner = fx.user("owner").await;
        let stranger = fx.user("stranger").await;

        let job = fx
            .dispatcher
            .submit(&Caller::principal(owner), NewScan::new("example.com", ScanMode::Passive))
            .await
            .unwrap();
        fx.wait_for(job.id, JobStatus::Completed).await;

        let denied = fx.dispatcher.rerun(&Caller::principal(stranger), job.id).await;
        assert!(matches!(denied, Err(ScanError::Forbidden)));

        let anonymous = fx
            .dispatcher
            .submit(&Caller::anonymous(None), NewScan::new("example.com", ScanMode::Passive))
            .await;
        assert!(matches!(anonymous, Err(ScanError::Forbidden)));
    }

    #[tokio::test]
    async fn execution_failures_are_recorded_on_the_job() {
        let fx = fixture(Arc::new(FakeExecutor::open(ExecutionDisposition::Failure)), true);
        let caller = Caller::principal(fx.user("owner").await);

        let job = fx
            .dispatcher
            .submit(&caller, NewScan::new("example.com", ScanMode::Passive))
            .await
            .unwrap();
        let failed = fx.wait_for(job.id, JobStatus::Failed).await;
        assert_eq!(failed.exit_code, Some(2));
        assert_eq!(
            failed.last_error.as_deref(),
            Some("scan exited with status 2: target unreachable")
        );
    }

    #[tokio::test]
    async fn spawn_errors_fail_the_job() {
        let executor = Arc::new(FakeExecutor {
            fail_to_spawn: true,
            ..FakeExecutor::open(ExecutionDisposition::Success)
        });
        let fx = fixture(executor, false);
        let owner = fx.user("owner").await;
        let job = fx.dispatcher.pending_job(
            owner.id,
            NewScan::new("example.com", ScanMode::Passive),
            None,
        );
        fx.uow.jobs.insert(&job).await.unwrap();

        let finished = fx.runner.run(job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.last_error.unwrap().contains("No such file"));
    }

    #[tokio::test]
    async fn a_job_runs_at_most_once_and_never_moves_backwards() {
        let executor = Arc::new(FakeExecutor::open(ExecutionDisposition::Success));
        let fx = fixture(Arc::clone(&executor), false);
        let owner = fx.user("owner").await;
        let job = fx.dispatcher.pending_job(
            owner.id,
            NewScan::new("example.com", ScanMode::Passive),
            None,
        );
        fx.uow.jobs.insert(&job).await.unwrap();

        let first = fx.runner.run(job.id).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert!(fx.runner.run(job.id).await.unwrap().is_none());
        assert!(fx.runner.run(JobId::new()).await.unwrap().is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let stored = fx.uow.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.started_at, first.started_at);
    }

    #[tokio::test]
    async fn recovery_requeues_pending_and_fails_running_jobs() {
        let fx = fixture(Arc::new(FakeExecutor::open(ExecutionDisposition::Success)), true);
        let owner = fx.user("owner").await;

        let pending = fx.dispatcher.pending_job(
            owner.id,
            NewScan::new("pending.example", ScanMode::Passive),
            None,
        );
        let mut running = fx.dispatcher.pending_job(
            owner.id,
            NewScan::new("running.example", ScanMode::Passive),
            None,
        );
        running.status = JobStatus::Running;
        running.started_at = Some(Utc::now());
        fx.uow.jobs.insert(&pending).await.unwrap();
        fx.uow.jobs.insert(&running).await.unwrap();

        let report = fx.dispatcher.recover().await.unwrap();
        assert_eq!(report.requeued, vec![pending.id]);
        assert_eq!(report.interrupted, vec![running.id]);

        fx.wait_for(pending.id, JobStatus::Completed).await;
        let interrupted = fx.uow.jobs.get(running.id).await.unwrap().unwrap();
        assert_eq!(interrupted.status, JobStatus::Failed);
        assert!(interrupted.last_error.unwrap().starts_with("interrupted"));
    }

    #[tokio::test]
    async fn jobs_that_cannot_be_queued_end_failed() {
        let fx = fixture(Arc::new(FakeExecutor::open(ExecutionDisposition::Success)), false);
        let caller = Caller::principal(fx.user("owner").await);

        let result = fx
            .dispatcher
            .submit(
                &caller,
                NewScan::new("example.com", ScanMode::Passive).with_options(ScanOptions {
                    verbose: true,
                    ..ScanOptions::default()
                }),
            )
            .await;
        assert!(matches!(result, Err(ScanError::Internal(_))));

        let page = fx
            .uow
            .jobs
            .list(&Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].status, JobStatus::Failed);
        assert_eq!(
            page.jobs[0].last_error.as_deref(),
            Some("Internal error: dispatcher unavailable")
        );
    }
}
