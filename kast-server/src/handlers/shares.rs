use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use kast_core::access::CreatedLink;
use kast_core::types::{JobId, PrincipalId, ShareGrant, ShareId, SharePermission};

use super::{ApiResponse, parse_id};
use crate::auth::AuthenticatedCaller;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ShareWithUserRequest {
    pub grantee_id: PrincipalId,
    pub permission: SharePermission,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub expires_in_seconds: i64,
}

/// POST /api/v1/scans/{id}/shares/users
pub async fn share_with_user_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
    Json(request): Json<ShareWithUserRequest>,
) -> AppResult<impl IntoResponse> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let grant = state
        .shares
        .share_with_principal(
            &caller,
            job_id,
            request.grantee_id,
            request.permission,
            request.expires_at,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(grant))))
}

/// POST /api/v1/scans/{id}/shares/links
///
/// The token is only ever returned here.
pub async fn create_link_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
    Json(request): Json<CreateLinkRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CreatedLink>>)> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let lifetime = Duration::try_seconds(request.expires_in_seconds)
        .ok_or_else(|| AppError::bad_request("expires_in_seconds is out of range"))?;
    let link = state
        .shares
        .create_public_link(&caller, job_id, lifetime)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(link))))
}

/// GET /api/v1/scans/{id}/shares
pub async fn list_shares_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<ShareGrant>>>> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let grants = state.shares.list(&caller, job_id).await?;
    Ok(Json(ApiResponse::success(grants)))
}

/// DELETE /api/v1/scans/{id}/shares/{share_id}
pub async fn revoke_share_handler(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path((id, share_id)): Path<(String, String)>,
) -> AppResult<Json<ApiResponse<ShareGrant>>> {
    let job_id: JobId = parse_id(&id, "scan")?;
    let share_id: ShareId = parse_id(&share_id, "share")?;
    let revoked = state.shares.revoke(&caller, job_id, share_id).await?;
    Ok(Json(ApiResponse::success(revoked)))
}
