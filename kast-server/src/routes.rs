use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{delete, get, post},
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::handlers::{imports, scans, shares, system};
use crate::state::AppState;

/// Complete application router: the versioned API plus health, tracing and
/// CORS layers.
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);
    Router::new()
        .route("/health", get(system::health_handler))
        .nest("/api/v1", create_v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route(
            "/scans",
            post(scans::create_scan_handler).get(scans::list_scans_handler),
        )
        .route(
            "/scans/{id}",
            get(scans::get_scan_handler).delete(scans::delete_scan_handler),
        )
        .route("/scans/{id}/status", get(scans::scan_status_handler))
        .route("/scans/{id}/rerun", post(scans::rerun_scan_handler))
        .route("/scans/{id}/report", get(scans::scan_report_handler))
        .route("/scans/{id}/transcript", get(scans::scan_transcript_handler))
        .route("/scans/{id}/shares", get(shares::list_shares_handler))
        .route(
            "/scans/{id}/shares/users",
            post(shares::share_with_user_handler),
        )
        .route("/scans/{id}/shares/links", post(shares::create_link_handler))
        .route(
            "/scans/{id}/shares/{share_id}",
            delete(shares::revoke_share_handler),
        )
        .route("/plugins", get(system::list_plugins_handler))
        .route("/stats", get(system::stats_handler))
        .route("/audit", get(system::audit_log_handler))
        .route("/imports", post(imports::import_scan_handler))
        .route("/imports/preview", post(imports::preview_import_handler))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
