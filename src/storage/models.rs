use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a file.
///
/// `Completed` and `Failed` are terminal. The only legal transitions are
/// pending -> processing, processing -> completed, processing -> failed and
/// pending -> failed (a job that could never be started).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub const ALL: [FileStatus; 4] = [
        FileStatus::Pending,
        FileStatus::Processing,
        FileStatus::Completed,
        FileStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }

    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Processing)
                | (FileStatus::Pending, FileStatus::Failed)
                | (FileStatus::Processing, FileStatus::Completed)
                | (FileStatus::Processing, FileStatus::Failed)
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a file derived from its MIME type and filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Audio,
    Video,
    Image,
    Document,
    Other,
}

const DOCUMENT_SUBTYPES: &[&str] = &[
    "pdf",
    "msword",
    "rtf",
    "csv",
    "epub+zip",
    "vnd.openxmlformats-officedocument.wordprocessingml.document",
    "vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "vnd.openxmlformats-officedocument.presentationml.presentation",
    "vnd.ms-excel",
    "vnd.ms-powerpoint",
    "vnd.oasis.opendocument.text",
    "vnd.oasis.opendocument.spreadsheet",
    "vnd.oasis.opendocument.presentation",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "odt", "rtf", "txt", "md", "csv", "xls", "xlsx", "ods", "ppt", "pptx",
    "odp", "epub",
];

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Audio,
        FileType::Video,
        FileType::Image,
        FileType::Document,
        FileType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Audio => "audio",
            FileType::Video => "video",
            FileType::Image => "image",
            FileType::Document => "document",
            FileType::Other => "other",
        }
    }

    /// Classify a file. A recognised MIME type wins; otherwise the filename
    /// extension decides. Anything unmatched is `Other`.
    pub fn classify(mime_type: Option<&str>, filename: &str) -> Self {
        mime_type
            .and_then(Self::from_mime)
            .or_else(|| Self::from_extension(filename))
            .unwrap_or(FileType::Other)
    }

    /// Derive a classification from a MIME type string, ignoring parameters.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let (primary, sub) = essence.split_once('/')?;
        match primary {
            "audio" => Some(FileType::Audio),
            "video" => Some(FileType::Video),
            "image" => Some(FileType::Image),
            "text" => Some(FileType::Document),
            "application" if DOCUMENT_SUBTYPES.contains(&sub) => Some(FileType::Document),
            _ => None,
        }
    }

    fn from_extension(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            return Some(FileType::Document);
        }
        mime_guess::from_ext(&ext)
            .iter()
            .find_map(|m| Self::from_mime(m.essence_str()))
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown file type '{0}'")]
pub struct UnknownFileType(pub String);

impl FromStr for FileType {
    type Err = UnknownFileType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownFileType(s.to_string()))
    }
}

/// A file record stored in redb
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub file_type: FileType,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub provider_ref: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub view_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Caller-supplied fields for a new registry entry.
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub source_url: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Partial update merged into an existing record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileUpdate {
    pub status: Option<FileStatus>,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub provider_ref: Option<String>,
    pub view_url: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: FileStatus, to: FileStatus },
    #[error("record would violate an invariant: {0}")]
    InvariantViolation(&'static str),
}

impl FileRecord {
    pub fn new(file_id: String, new: NewFile, now: DateTime<Utc>) -> Self {
        let file_type = FileType::classify(new.mime_type.as_deref(), &new.filename);
        Self {
            file_id,
            filename: new.filename,
            size: 0,
            mime_type: new.mime_type,
            file_type,
            status: FileStatus::Pending,
            created_at: now,
            updated_at: now,
            provider_ref: None,
            source_url: new.source_url,
            view_url: None,
            download_url: None,
            error: None,
            metadata: new.metadata,
        }
    }

    /// Merge `update` into the record. On error the record is left untouched.
    pub fn apply(&mut self, update: &FileUpdate, now: DateTime<Utc>) -> Result<(), UpdateError> {
        let mut next = self.clone();

        if let Some(status) = update.status {
            if status != self.status && !self.status.can_transition_to(status) {
                return Err(UpdateError::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            next.status = status;
        }
        if let Some(size) = update.size {
            next.size = size;
        }
        if let Some(ref mime_type) = update.mime_type {
            next.mime_type = Some(mime_type.clone());
            next.file_type = FileType::classify(Some(mime_type), &next.filename);
        }
        if let Some(ref provider_ref) = update.provider_ref {
            next.provider_ref = Some(provider_ref.clone());
        }
        if let Some(ref view_url) = update.view_url {
            next.view_url = Some(view_url.clone());
        }
        if let Some(ref download_url) = update.download_url {
            next.download_url = Some(download_url.clone());
        }
        if let Some(ref error) = update.error {
            next.error = Some(error.clone());
        }
        if let Some(ref metadata) = update.metadata {
            next.metadata = metadata.clone();
        }

        next.check_invariants()?;
        next.updated_at = now.max(self.updated_at);
        *self = next;
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), UpdateError> {
        let completed = self.status == FileStatus::Completed;
        if completed != self.view_url.is_some() || completed != self.download_url.is_some() {
            return Err(UpdateError::InvariantViolation(
                "view_url and download_url must be set exactly when completed",
            ));
        }
        if completed != self.provider_ref.is_some() {
            return Err(UpdateError::InvariantViolation(
                "provider_ref must be set exactly when completed",
            ));
        }
        if (self.status == FileStatus::Failed) != self.error.is_some() {
            return Err(UpdateError::InvariantViolation(
                "error must be set exactly when failed",
            ));
        }
        Ok(())
    }
}

/// Values reported by a storage provider once a transfer succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub provider_ref: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub view_url: String,
    pub download_url: String,
}

/// Lifecycle writes reported by transfer workers and applied by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    MarkProcessing { file_id: String },
    Complete { file_id: String, completion: Completion },
    Fail { file_id: String, reason: String },
}

impl WriteOp {
    pub fn file_id(&self) -> &str {
        match self {
            WriteOp::MarkProcessing { file_id }
            | WriteOp::Complete { file_id, .. }
            | WriteOp::Fail { file_id, .. } => file_id,
        }
    }

    pub fn to_update(&self) -> FileUpdate {
        match self {
            WriteOp::MarkProcessing { .. } => FileUpdate {
                status: Some(FileStatus::Processing),
                ..Default::default()
            },
            WriteOp::Complete { completion, .. } => FileUpdate {
                status: Some(FileStatus::Completed),
                size: Some(completion.size),
                mime_type: completion.mime_type.clone(),
                provider_ref: Some(completion.provider_ref.clone()),
                view_url: Some(completion.view_url.clone()),
                download_url: Some(completion.download_url.clone()),
                ..Default::default()
            },
            WriteOp::Fail { reason, .. } => FileUpdate {
                status: Some(FileStatus::Failed),
                error: Some(reason.clone()),
                ..Default::default()
            },
        }
    }
}

/// Render a byte count the way listings and stats display it (e.g. `1.5 KB`).
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
