use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::response::ApiError;
use crate::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Reject requests that do not carry the configured API key.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| secure_compare(key, &state.config.api_key));

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Invalid API key attempt");
        return ApiError::unauthorized("Invalid API key").into_response();
    }
    next.run(request).await
}
