use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use kast_core::catalog::ScanDetail;
use kast_core::dispatch::NewScan;
use kast_core::progress::StatusSnapshot;
use kast_core::types::{JobFilter, JobId, JobStatus, PageRequest, ScanJob};

use super::{ApiResponse, parse_id};
use crate::auth::{AuthenticatedCaller, RequestCaller};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerun_of: Option<JobId>,
}

impl From<&ScanJob> for DispatchResponse {
    fn from(job: &ScanJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            rerun_of: job.rerun_of,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListScansQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub status: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScanListResponse {
    pub scans: Vec<ScanJob>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub pages: u64,
}

/// POST /api/v1/scans
pub async fn create_scan_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(request): Json<NewScan>,
) -> AppResult<impl IntoResponse> {
    let job = state.dispatcher.submit(&caller, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(DispatchResponse::from(&job))),
    ))
}

/// GET /api/v1/scans
pub async fn list_scans_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Query(query): Query<ListScansQuery>,
) -> AppResult<Json<ApiResponse<ScanListResponse>>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let filter = JobFilter {
        owner: None,
        status,
        target_contains: query
            .target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
    };

    let page = state
        .catalog
        .list(&caller, filter, PageRequest::new(query.page, query.per_page))
        .await?;
    let pages = page.pages();
    Ok(Json(ApiResponse::success(ScanListResponse {
        scans: page.jobs,
        total: page.total,
        page: page.page,
        per_page: page.per_page,
        pages,
    })))
}

/// GET /api/v1/scans/{id}
pub async fn get_scan_handler(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<ScanDetail>>> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let detail = state.catalog.detail(&caller, job_id).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// GET /api/v1/scans/{id}/status
pub async fn scan_status_handler(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<StatusSnapshot>>> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let job = state
        .access
        .require(job_id, &caller, kast_core::access::AccessLevel::View)
        .await?;
    let snapshot = state.status.snapshot(&job).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/v1/scans/{id}/rerun
pub async fn rerun_scan_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let job = state.dispatcher.rerun(&caller, job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(DispatchResponse::from(&job))),
    ))
}

/// DELETE /api/v1/scans/{id}
pub async fn delete_scan_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let job = state.catalog.delete(&caller, job_id).await?;
    info!(job_id = %job.id, "scan deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/scans/{id}/report
pub async fn scan_report_handler(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let path = state.catalog.report_path(&caller, job_id).await?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::not_found(format!("report for scan {job_id}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    ))
}

/// GET /api/v1/scans/{id}/transcript
pub async fn scan_transcript_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let path = state.catalog.transcript_path(&caller, job_id).await?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::not_found(format!("transcript for scan {job_id}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    ))
}
