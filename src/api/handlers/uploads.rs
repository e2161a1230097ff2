use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::response::{ApiError, AppJson};
use crate::pipeline::{
    BatchError, BatchOutcome, ImportRequest, IngestError, UploadRequest, MAX_BATCH_FILES,
};
use crate::storage::models::FileStatus;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub file_id: String,
    pub status: FileStatus,
}

#[derive(Debug, Deserialize)]
pub struct ImportUrlRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Error)]
enum ReadError {
    #[error("File too large: exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("Failed to read file: {0}")]
    Multipart(#[from] MultipartError),
}

// ============================================================================
// Handlers
// ============================================================================

/// Direct upload. Failures answer with a `null` body.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<AcceptedResponse>, ApiError> {
    let mut upload: Option<UploadRequest> = None;
    let mut metadata = Metadata::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!(error = %e, "Invalid multipart upload");
        ApiError::Null(StatusCode::BAD_REQUEST)
    })? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                let limit = state.config.pipeline.max_upload_size;
                upload = Some(read_upload(field, limit).await.map_err(|e| {
                    tracing::warn!(error = %e, "Failed to read uploaded file");
                    ApiError::Null(StatusCode::BAD_REQUEST)
                })?);
            }
            "metadata" => {
                metadata = read_metadata(field).await.map_err(|e| {
                    tracing::warn!(error = %e, "Invalid upload metadata");
                    ApiError::Null(StatusCode::BAD_REQUEST)
                })?;
            }
            _ => {}
        }
    }

    let mut upload = upload.ok_or_else(|| {
        tracing::warn!("Upload without a file field");
        ApiError::Null(StatusCode::BAD_REQUEST)
    })?;
    upload.metadata = metadata;

    let file = state
        .pipeline
        .submit_upload(upload)
        .await
        .map_err(|e| null_error(&e))?;

    Ok(Json(AcceptedResponse {
        file_id: file.file_id,
        status: file.status,
    }))
}

/// Batch upload from repeated `files` (or `files[]`) fields. Items that
/// cannot be read are reported alongside the rejected ones.
pub async fn upload_multiple(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<BatchOutcome>, ApiError> {
    let limit = state.config.pipeline.max_upload_size;
    let mut uploads = Vec::new();
    let mut unread = Vec::new();
    let mut metadata = Metadata::new();
    let mut seen = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Message(e.status(), format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "files" | "files[]" => {
                seen += 1;
                let filename = field.file_name().unwrap_or_default().to_string();
                if seen > MAX_BATCH_FILES {
                    unread.push(BatchError {
                        filename,
                        error: format!("Batch is limited to {MAX_BATCH_FILES} files"),
                    });
                    continue;
                }
                match read_upload(field, limit).await {
                    Ok(upload) => uploads.push(upload),
                    Err(ReadError::Multipart(e)) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                        return Err(ApiError::Message(e.status(), e.body_text()));
                    }
                    Err(e) => {
                        tracing::warn!(filename = %filename, error = %e, "Batch item unreadable");
                        unread.push(BatchError {
                            filename,
                            error: e.to_string(),
                        });
                    }
                }
            }
            "metadata" => {
                metadata = read_metadata(field)
                    .await
                    .map_err(ApiError::bad_request)?;
            }
            _ => {}
        }
    }

    if uploads.is_empty() && unread.is_empty() {
        return Err(ApiError::bad_request("No files provided"));
    }
    for upload in &mut uploads {
        upload.metadata = metadata.clone();
    }

    let mut outcome = state.pipeline.submit_batch(uploads).await;
    outcome.errors.extend(unread);
    tracing::info!(
        accepted = outcome.file_ids.len(),
        rejected = outcome.errors.len(),
        "Batch upload processed"
    );
    Ok(Json(outcome))
}

/// Import a file from a remote URL.
pub async fn import_url(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<ImportUrlRequest>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    let url = req
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("URL required"))?;

    let file = state
        .pipeline
        .submit_import(ImportRequest {
            url,
            filename: req.filename,
            metadata: req.metadata.unwrap_or_default(),
        })
        .await
        .map_err(|e| match e {
            IngestError::Validation(message) => ApiError::bad_request(message),
            e => null_error(&e),
        })?;

    Ok(Json(AcceptedResponse {
        file_id: file.file_id,
        status: file.status,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

/// Buffer one file field, giving up as soon as it exceeds `limit` bytes.
async fn read_upload(mut field: Field<'_>, limit: u64) -> Result<UploadRequest, ReadError> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let mime_type = field.content_type().map(|s| s.to_string());

    let mut data = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
        if (data.len() + chunk.len()) as u64 > limit {
            return Err(ReadError::TooLarge { limit });
        }
        data.extend_from_slice(&chunk);
    }

    Ok(UploadRequest {
        filename,
        mime_type,
        data: data.freeze(),
        metadata: Metadata::new(),
    })
}

async fn read_metadata(field: Field<'_>) -> Result<Metadata, String> {
    let text = field
        .text()
        .await
        .map_err(|e| format!("Invalid metadata: {e}"))?;
    if text.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(&text).map_err(|e| format!("metadata must be a JSON object: {e}"))
}

fn null_error(e: &IngestError) -> ApiError {
    if e.is_client_error() {
        tracing::warn!(error = %e, "Upload rejected");
        ApiError::Null(StatusCode::BAD_REQUEST)
    } else {
        tracing::error!(error = %e, "Upload failed");
        ApiError::Null(StatusCode::INTERNAL_SERVER_ERROR)
    }
}
