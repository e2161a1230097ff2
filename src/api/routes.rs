use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::auth::require_api_key;
use super::handlers;
use crate::pipeline::MAX_BATCH_FILES;
use crate::AppState;

/// Room for multipart boundaries and the metadata field on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let max_upload_size =
        usize::try_from(state.config.pipeline.max_upload_size).unwrap_or(usize::MAX);
    let upload_limit = max_upload_size.saturating_add(MULTIPART_OVERHEAD);
    let batch_limit = max_upload_size
        .saturating_mul(MAX_BATCH_FILES)
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        // Ingestion
        .route(
            "/api/upload",
            post(handlers::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/upload/multiple",
            post(handlers::upload_multiple).layer(DefaultBodyLimit::max(batch_limit)),
        )
        .route("/api/upload/audio", post(handlers::import_url))
        // Queries
        .route("/api/file/:id/info", get(handlers::file_info))
        .route("/api/file/:id/view-url", get(handlers::view_url))
        .route("/api/file/:id/download-url", get(handlers::download_url))
        .route("/api/file/:id", delete(handlers::delete_file))
        .route("/api/files", get(handlers::list_files))
        .route("/api/stats", get(handlers::stats))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .merge(api)
        // Public
        .route("/view/:id", get(handlers::view_file))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
