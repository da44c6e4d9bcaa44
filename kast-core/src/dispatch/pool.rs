use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::database::ports::ScanJobRepository;
use crate::error::{Result, ScanError};
use crate::execution::{ExecutionRequest, ScanExecutor};
use crate::progress::ResultsAggregator;
use crate::types::{JobId, JobStatus, ScanJob, StatusTransition};

/// Executes one job end to end. Owns every status write after `pending`.
#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<dyn ScanJobRepository>,
    executor: Arc<dyn ScanExecutor>,
    aggregator: ResultsAggregator,
    timeout: Duration,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("jobs", &std::any::type_name_of_val(self.jobs.as_ref()))
            .field("executor", &std::any::type_name_of_val(self.executor.as_ref()))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// `timeout` is only used to phrase the error of a timed-out job; the
    /// executor enforces it.
    pub fn new(
        jobs: Arc<dyn ScanJobRepository>,
        executor: Arc<dyn ScanExecutor>,
        aggregator: ResultsAggregator,
        timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            executor,
            aggregator,
            timeout,
        }
    }

    /// Claim the job, run the tool and record the terminal status.
    ///
    /// Returns `None` when the job is gone or another worker already claimed
    /// it; the claim is a compare-and-set from `pending`, so a job enqueued
    /// twice still runs once.
    pub async fn run(&self, job_id: JobId) -> Result<Option<ScanJob>> {
        let claim = StatusTransition::new(JobStatus::Pending, JobStatus::Running, Utc::now())
            .with_task_handle(format!("run-{}", Uuid::now_v7()));
        let Some(job) = self.jobs.transition(job_id, &claim).await? else {
            debug!(job_id = %job_id, "scan no longer pending; skipping");
            return Ok(None);
        };
        info!(
            job_id = %job.id,
            target = %job.target,
            mode = %job.mode,
            task_handle = ?job.task_handle,
            "scan started"
        );

        let request = ExecutionRequest::from_job(&job);
        let finish = match self.executor.execute(&request).await {
            Ok(outcome) if outcome.succeeded() => {
                StatusTransition::new(JobStatus::Running, JobStatus::Completed, Utc::now())
                    .with_exit_code(outcome.exit_code)
                    .with_transcript(outcome.transcript_path)
            }
            Ok(outcome) => {
                let error = outcome
                    .error_summary(self.timeout)
                    .unwrap_or_else(|| "scan failed".to_string());
                StatusTransition::new(JobStatus::Running, JobStatus::Failed, Utc::now())
                    .with_error(error)
                    .with_exit_code(outcome.exit_code)
                    .with_transcript(outcome.transcript_path)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "scan could not be executed");
                StatusTransition::new(JobStatus::Running, JobStatus::Failed, Utc::now())
                    .with_error(e.to_string())
            }
        };

        let Some(finished) = self.jobs.transition(job.id, &finish).await? else {
            warn!(job_id = %job.id, to = %finish.to, "scan left running state underneath the worker");
            return Ok(None);
        };
        info!(
            job_id = %finished.id,
            status = %finished.status,
            exit_code = ?finished.exit_code,
            duration_secs = ?finished.duration_seconds(),
            "scan finished"
        );

        match self.aggregator.aggregate_job(&finished).await {
            Ok(report) if report.is_clean() => {
                debug!(job_id = %finished.id, upserted = report.upserted.len(), "final aggregation complete");
            }
            Ok(report) => {
                warn!(
                    job_id = %finished.id,
                    upserted = report.upserted.len(),
                    failed = report.failed.len(),
                    "final aggregation skipped unparseable artifacts"
                );
            }
            Err(e) => {
                warn!(job_id = %finished.id, error = %e, "final aggregation failed");
            }
        }

        Ok(Some(finished))
    }
}

/// Sending half of the worker queue.
#[derive(Clone, Debug)]
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
}

impl JobQueue {
    /// Waits for queue capacity. Fails only once the pool has shut down.
    pub async fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.tx
            .send(job_id)
            .await
            .map_err(|_| ScanError::Internal("dispatcher unavailable".into()))
    }

    /// A queue whose receiver is already gone.
    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Fixed set of workers pulling job ids from one bounded queue. Each job
/// holds its worker for the full run.
#[derive(Debug)]
pub struct WorkerPool {
    queue: JobQueue,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers that stop when `cancel` fires.
    pub fn start(runner: JobRunner, config: &DispatcherConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let count = config.workers.max(1);

        let workers = (0..count)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    runner.clone(),
                    Arc::clone(&rx),
                    cancel.clone(),
                ))
            })
            .collect();
        info!(workers = count, capacity = config.queue_capacity, "scan worker pool started");

        Self {
            queue: JobQueue { tx },
            cancel,
            workers,
        }
    }

    /// Handle for enqueueing job ids.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Stop taking work and wait up to `grace` for in-flight jobs. Workers
    /// still running afterwards are aborted, which kills their child process;
    /// the next startup marks those jobs failed.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let mut workers = self.workers;

        let joined = tokio::time::timeout(grace, async {
            for worker in workers.iter_mut() {
                if let Err(e) = worker.await
                    && !e.is_cancelled()
                {
                    error!(error = %e, "scan worker panicked");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(grace_secs = grace.as_secs(), "scan workers did not stop in time; aborting");
            for worker in &workers {
                worker.abort();
            }
        }
        info!("scan worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    runner: JobRunner,
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "scan worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(job_id) = next else {
            break;
        };
        if let Err(e) = runner.run(job_id).await {
            error!(worker = index, job_id = %job_id, error = %e, "scan worker failed to process job");
        }
    }
    debug!(worker = index, "scan worker stopped");
}
