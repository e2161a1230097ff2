//! Read side of the registry: translates stored lifecycle state into what
//! clients may see, including the not-ready and failed signals.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::provider::{ProviderError, StorageProvider};
use crate::storage::models::{FileRecord, FileStatus, FileType};
use crate::storage::{Database, DatabaseError, RegistryStats};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("File not found")]
    NotFound,
    #[error("File not ready: {0}")]
    NotReady(FileStatus),
    #[error("File failed: {0}")]
    Failed(String),
    #[error("Storage provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Registry error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    View,
    Download,
}

pub struct QueryService {
    db: Database,
    provider: Arc<dyn StorageProvider>,
}

impl QueryService {
    pub fn new(db: Database, provider: Arc<dyn StorageProvider>) -> Self {
        Self { db, provider }
    }

    /// Full current record, whatever its status.
    pub fn info(&self, file_id: &str) -> Result<FileRecord, QueryError> {
        self.db.get_file(file_id)?.ok_or(QueryError::NotFound)
    }

    pub fn view_url(&self, file_id: &str) -> Result<String, QueryError> {
        self.url(file_id, UrlKind::View)
    }

    pub fn download_url(&self, file_id: &str) -> Result<String, QueryError> {
        self.url(file_id, UrlKind::Download)
    }

    /// Resolve a completion-dependent URL. Pending and processing files are
    /// not ready yet; failed files never will be.
    pub fn url(&self, file_id: &str, kind: UrlKind) -> Result<String, QueryError> {
        let file = ready(self.info(file_id)?)?;
        let url = match kind {
            UrlKind::View => file.view_url,
            UrlKind::Download => file.download_url,
        };
        url.ok_or(QueryError::NotReady(file.status))
    }

    pub fn list(&self, file_type: Option<FileType>, limit: usize) -> Result<Vec<FileRecord>, QueryError> {
        Ok(self.db.list_files(file_type, limit)?)
    }

    pub fn stats(&self) -> Result<RegistryStats, QueryError> {
        Ok(self.db.stats()?)
    }

    /// Remove the registry entry. Removing the stored blob is best-effort.
    pub async fn delete(&self, file_id: &str) -> Result<FileRecord, QueryError> {
        let file = self.info(file_id)?;
        if !self.db.delete_file(file_id)? {
            return Err(QueryError::NotFound);
        }

        if let Some(ref provider_ref) = file.provider_ref {
            match self.provider.delete(provider_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(file_id = %file_id, "Provider does not support deletion");
                }
                Err(e) => {
                    tracing::warn!(file_id = %file_id, error = %e, "Failed to delete blob from provider");
                }
            }
        }

        tracing::info!(file_id = %file_id, filename = %file.filename, "Deleted file");
        Ok(file)
    }

    /// Record owning the given provider reference.
    pub fn record_by_ref(&self, provider_ref: &str) -> Result<FileRecord, QueryError> {
        self.db
            .get_file_by_provider_ref(provider_ref)?
            .ok_or(QueryError::NotFound)
    }

    /// Stored bytes of a completed file, addressed by file id or by provider
    /// reference.
    pub async fn content(&self, identifier: &str) -> Result<(FileRecord, Bytes), QueryError> {
        let file = match self.info(identifier) {
            Err(QueryError::NotFound) => self.record_by_ref(identifier)?,
            found => found?,
        };
        let file = ready(file)?;
        let provider_ref = file
            .provider_ref
            .as_deref()
            .ok_or(QueryError::NotReady(file.status))?;
        let data = self.provider.fetch(provider_ref).await?;
        Ok((file, data))
    }
}

fn ready(file: FileRecord) -> Result<FileRecord, QueryError> {
    match file.status {
        FileStatus::Completed => Ok(file),
        FileStatus::Failed => Err(QueryError::Failed(
            file.error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        status => Err(QueryError::NotReady(status)),
    }
}
