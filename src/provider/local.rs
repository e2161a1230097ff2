use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{Blob, ProviderError, StorageProvider, StoredBlob};

/// Local filesystem provider for development and testing.
pub struct LocalProvider {
    base_path: PathBuf,
}

impl LocalProvider {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, provider_ref: &str) -> Result<PathBuf, ProviderError> {
        // Refs are generated here as simple uuids; anything else cannot name a blob.
        if provider_ref.is_empty() || !provider_ref.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProviderError::NotFound(provider_ref.to_string()));
        }
        Ok(self.base_path.join(provider_ref))
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    async fn store(&self, blob: Blob) -> Result<StoredBlob, ProviderError> {
        let provider_ref = uuid::Uuid::new_v4().simple().to_string();
        let path = self.blob_path(&provider_ref)?;
        tokio::fs::write(&path, &blob.data).await?;
        tracing::debug!(provider_ref = %provider_ref, filename = %blob.filename, "Stored blob locally");

        Ok(StoredBlob {
            provider_ref,
            size: blob.data.len() as u64,
            mime_type: None,
            download_url: None,
        })
    }

    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError> {
        let path = self.blob_path(provider_ref)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(provider_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, provider_ref: &str) -> Result<bool, ProviderError> {
        let path = self.blob_path(provider_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
