use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::response::{ApiError, AppQuery};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ViewParams {
    #[serde(default)]
    pub download: bool,
}

/// Serve the stored content of a completed file. The path segment is a
/// file id or, failing that, a provider reference.
/// Route: GET /view/:id
pub async fn view_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<ViewParams>,
) -> Result<Response, ApiError> {
    let (file, data) = state.query.content(&id).await?;
    let size = data.len() as u64;

    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    let content_type = file
        .mime_type
        .as_deref()
        .and_then(|m| HeaderValue::from_str(m).ok())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));

    let disposition = if params.download { "attachment" } else { "inline" };
    if let Ok(value) = HeaderValue::from_str(&format!("{disposition}; filename=\"{}\"", file.filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Content never changes once a file is completed.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );

    Ok(response)
}
