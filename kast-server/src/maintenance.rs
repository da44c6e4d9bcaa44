//! Background upkeep that runs for the life of the server.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kast_core::audit::AuditService;

/// Periodically drop audit records older than `retention`. The first pass
/// runs immediately.
pub fn spawn_audit_prune_worker(
    audit: AuditService,
    retention: chrono::Duration,
    interval: Duration,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            retention_days = retention.num_days(),
            interval_secs = interval.as_secs(),
            "Audit prune worker started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = audit.prune(retention, Utc::now()).await {
                        error!(error = %e, "Audit prune failed");
                    }
                }
                _ = shutdown_token.cancelled() => {
                    info!("Audit prune worker shutting down");
                    break;
                }
            }
        }
    })
}
