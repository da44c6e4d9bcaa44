use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use kast_core::access::{AccessResolver, ShareService, TokenHasher};
use kast_core::application::ScanUnitOfWork;
use kast_core::artifacts::ArtifactLayout;
use kast_core::audit::AuditService;
use kast_core::catalog::ScanCatalog;
use kast_core::dispatch::{JobDispatcher, JobRunner, WorkerPool};
use kast_core::execution::ScanExecutor;
use kast_core::import::ScanImporter;
use kast_core::progress::{PluginStateInferencer, ResultsAggregator, StatusService};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub unit_of_work: ScanUnitOfWork,
    pub access: AccessResolver,
    pub shares: ShareService,
    pub dispatcher: JobDispatcher,
    pub catalog: ScanCatalog,
    pub status: StatusService,
    pub importer: ScanImporter,
    pub audit: AuditService,
    pub executor: Arc<dyn ScanExecutor>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Wire every service over `unit_of_work` and start the scan worker pool.
/// The pool stops when `shutdown` is cancelled.
pub fn build_app_state(
    config: Arc<Config>,
    unit_of_work: ScanUnitOfWork,
    executor: Arc<dyn ScanExecutor>,
    shutdown: CancellationToken,
) -> anyhow::Result<(AppState, WorkerPool)> {
    let engine = &config.engine;
    let layout = Arc::new(
        ArtifactLayout::new(&engine.artifacts).context("invalid artifact configuration")?,
    );
    let hasher = TokenHasher::new(&config.token_key).context("invalid KAST_TOKEN_KEY")?;

    let audit = AuditService::new(unit_of_work.audit.clone());
    let access = AccessResolver::new(
        unit_of_work.jobs.clone(),
        unit_of_work.shares.clone(),
        unit_of_work.principals.clone(),
        hasher,
        audit.clone(),
    );
    let shares = ShareService::new(
        access.clone(),
        unit_of_work.shares.clone(),
        unit_of_work.principals.clone(),
        audit.clone(),
    );
    let aggregator = ResultsAggregator::new(
        PluginStateInferencer::new(Arc::clone(&layout)),
        unit_of_work.results.clone(),
        engine.aggregator.clone(),
    );

    let runner = JobRunner::new(
        unit_of_work.jobs.clone(),
        Arc::clone(&executor),
        aggregator.clone(),
        engine.executor.timeout,
    );
    let pool = WorkerPool::start(runner, &engine.dispatcher, shutdown);

    let dispatcher = JobDispatcher::new(
        unit_of_work.jobs.clone(),
        Arc::clone(&layout),
        access.clone(),
        audit.clone(),
        pool.queue(),
    );
    let importer = ScanImporter::new(
        unit_of_work.jobs.clone(),
        unit_of_work.principals.clone(),
        Arc::clone(&layout),
        aggregator.clone(),
        audit.clone(),
    )
    .context("failed to build scan importer")?;
    let catalog = ScanCatalog::new(
        unit_of_work.jobs.clone(),
        unit_of_work.results.clone(),
        access.clone(),
        audit.clone(),
        layout,
    );

    let state = AppState {
        config,
        unit_of_work,
        access,
        shares,
        dispatcher,
        catalog,
        status: StatusService::new(aggregator),
        importer,
        audit,
        executor,
    };
    Ok((state, pool))
}
