use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, AppQuery};
use crate::storage::models::{format_size, FileRecord, FileStatus, FileType};
use crate::storage::DEFAULT_LIST_LIMIT;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct FileResponse {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub size_formatted: String,
    pub mime_type: Option<String>,
    pub file_type: FileType,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ViewUrlResponse {
    pub view_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadUrlResponse {
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub total: usize,
    pub files: Vec<FileResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_files: u64,
    pub completed: u64,
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub total_size: u64,
    pub total_size_formatted: String,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FileResponse>, ApiError> {
    let file = state.query.info(&id)?;
    Ok(Json(file_to_response(&file)))
}

pub async fn view_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ViewUrlResponse>, ApiError> {
    let view_url = state.query.view_url(&id)?;
    Ok(Json(ViewUrlResponse { view_url }))
}

pub async fn download_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let download_url = state.query.download_url(&id)?;
    Ok(Json(DownloadUrlResponse { download_url }))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<ListFilesResponse>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let file_type = match params.file_type.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<FileType>().map_err(|_| {
            ApiError::bad_request(format!(
                "Invalid file type. Valid types: {}",
                FileType::ALL.map(|t| t.as_str()).join(", ")
            ))
        })?),
    };

    let files: Vec<FileResponse> = state
        .query
        .list(file_type, params.limit)?
        .iter()
        .map(file_to_response)
        .collect();

    Ok(Json(ListFilesResponse {
        total: files.len(),
        files,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let file = state.query.delete(&id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("File {} deleted", file.file_id),
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.query.stats()?;

    let by_status = FileStatus::ALL
        .into_iter()
        .map(|s| (s.as_str().to_string(), stats.count(s)))
        .collect();
    let by_type = stats
        .by_type
        .iter()
        .map(|(t, n)| (t.as_str().to_string(), *n))
        .collect();

    Ok(Json(StatsResponse {
        total_files: stats.total_files,
        completed: stats.count(FileStatus::Completed),
        pending: stats.count(FileStatus::Pending),
        processing: stats.count(FileStatus::Processing),
        failed: stats.count(FileStatus::Failed),
        total_size: stats.total_size,
        total_size_formatted: format_size(stats.total_size),
        by_type,
        by_status,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        file_id: file.file_id.clone(),
        filename: file.filename.clone(),
        size: file.size,
        size_formatted: format_size(file.size),
        mime_type: file.mime_type.clone(),
        file_type: file.file_type,
        status: file.status,
        telegram_file_id: file.provider_ref.clone(),
        url: file.source_url.clone(),
        view_url: file.view_url.clone(),
        download_url: file.download_url.clone(),
        error: file.error.clone(),
        created_at: file.created_at.to_rfc3339(),
        updated_at: file.updated_at.to_rfc3339(),
        metadata: file.metadata.clone(),
    }
}
