use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;

use kast_core::import::{ImportPreview, ImportRequest};

use super::ApiResponse;
use crate::auth::AuthenticatedCaller;
use crate::errors::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PreviewImportRequest {
    pub directory: String,
}

/// POST /api/v1/imports/preview
pub async fn preview_import_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(request): Json<PreviewImportRequest>,
) -> AppResult<Json<ApiResponse<ImportPreview>>> {
    let preview = state.importer.preview(&caller, &request.directory).await?;
    Ok(Json(ApiResponse::success(preview)))
}

/// POST /api/v1/imports
pub async fn import_scan_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(request): Json<ImportRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.importer.import(&caller, &request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(job))))
}
