use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use kast_core::execution::PluginInfo;
use kast_core::types::{AuditRecord, JobStats};

use super::ApiResponse;
use crate::auth::AuthenticatedCaller;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

const DEFAULT_AUDIT_LIMIT: u32 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<u32>,
}

/// GET /health
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/v1/plugins
pub async fn list_plugins_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(_caller): AuthenticatedCaller,
) -> AppResult<Json<ApiResponse<Vec<PluginInfo>>>> {
    let plugins = state.executor.list_plugins().await?;
    Ok(Json(ApiResponse::success(plugins)))
}

/// GET /api/v1/stats
pub async fn stats_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
) -> AppResult<Json<ApiResponse<JobStats>>> {
    let stats = state.catalog.stats(&caller).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// GET /api/v1/audit
pub async fn audit_log_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Query(query): Query<AuditQuery>,
) -> AppResult<Json<ApiResponse<Vec<AuditRecord>>>> {
    if !caller.is_admin() {
        return Err(AppError::forbidden("Forbidden"));
    }
    let records = state
        .audit
        .recent(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
        .await?;
    Ok(Json(ApiResponse::success(records)))
}
