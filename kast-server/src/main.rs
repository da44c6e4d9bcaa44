//! # Kast Server
//!
//! Runs `kast` scans on behalf of API clients and reports their progress.
//!
//! The server is built on Axum and uses:
//! - PostgreSQL for jobs, per-plugin results, shares and the audit trail
//! - the `kast` CLI, one child process per scan
//! - a bounded worker pool so only a fixed number of scans run at once

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kast_core::application::ScanUnitOfWork;
use kast_core::execution::KastCliExecutor;
use kast_core::types::PrincipalRole;

use kast_server::{build_app_state, config::Config, maintenance, routes};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "kast-server")]
#[command(about = "Scan orchestration server for the kast CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
    #[command(subcommand)]
    Principal(PrincipalCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    /// Create a principal and print its API key
    Create {
        username: String,
        /// Grant the admin role
        #[arg(long, default_value_t = false)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kast_core=info,kast_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(port) = cli.serve.port {
        config.server_port = port;
    }
    if let Some(host) = cli.serve.host.clone() {
        config.server_host = host;
    }

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => {
            connect(&config)
                .await
                .context("database migration failed")?;
            info!("Database migrations applied successfully");
            Ok(())
        }
        Some(Command::Principal(PrincipalCommand::Create { username, admin })) => {
            create_principal(config, &username, admin).await
        }
        None => run_server(config).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    let Some(database_url) = config.database_url.as_deref() else {
        error!("DATABASE_URL must be provided");
        anyhow::bail!("No PostgreSQL connection configuration found");
    };
    if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")) {
        anyhow::bail!("Invalid database URL: must start with postgres:// or postgresql://");
    }
    let pool = kast_core::database::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(pool)
}

async fn create_principal(config: Config, username: &str, admin: bool) -> anyhow::Result<()> {
    let pool = connect(&config).await?;
    let uow = ScanUnitOfWork::postgres(pool);
    let executor = Arc::new(KastCliExecutor::new(config.engine.executor.clone()));
    let shutdown = CancellationToken::new();
    let (state, workers) = build_app_state(Arc::new(config), uow, executor, shutdown)?;

    let role = if admin {
        PrincipalRole::Admin
    } else {
        PrincipalRole::User
    };
    let (principal, api_key) = state.access.create_principal(username, role).await?;
    workers.shutdown(std::time::Duration::from_secs(1)).await;

    info!(principal_id = %principal.id, role = role.as_str(), "principal created");
    println!("{api_key}");
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = connect(&config).await?;
    let uow = ScanUnitOfWork::postgres(pool);

    info!(
        cli = %config.engine.executor.cli_path.display(),
        results_root = %config.engine.artifacts.results_root.display(),
        workers = config.engine.dispatcher.workers,
        timeout_secs = config.engine.executor.timeout.as_secs(),
        "scan engine configuration in effect"
    );

    let config = Arc::new(config);
    let executor = Arc::new(KastCliExecutor::new(config.engine.executor.clone()));
    let shutdown = CancellationToken::new();
    let (state, workers) =
        build_app_state(Arc::clone(&config), uow, executor, shutdown.clone())?;

    let recovery = state
        .dispatcher
        .recover()
        .await
        .context("failed to recover scans from the previous run")?;
    if !recovery.requeued.is_empty() || !recovery.interrupted.is_empty() {
        info!(
            requeued = recovery.requeued.len(),
            interrupted = recovery.interrupted.len(),
            "recovered scans from the previous run"
        );
    }

    let pruner = maintenance::spawn_audit_prune_worker(
        state.audit.clone(),
        config.audit_retention,
        config.audit_prune_interval,
        shutdown.clone(),
    );

    let router = routes::create_app(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting Kast Server (HTTP) on {}", addr);

    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    workers
        .shutdown(config.engine.dispatcher.shutdown_grace)
        .await;
    if let Err(e) = pruner.await {
        warn!(error = %e, "audit prune worker ended abnormally");
    }
    info!("Kast Server stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
    token.cancel();
}
