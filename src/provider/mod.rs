mod local;
mod telegram;

pub use local::LocalProvider;
pub use telegram::TelegramProvider;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Provider request failed: {0}")]
    Backend(String),
    #[error("Provider rejected the upload: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Backend(e.to_string())
    }
}

/// Content handed to a provider for durable storage.
#[derive(Debug, Clone)]
pub struct Blob {
    pub filename: String,
    pub mime_type: Option<String>,
    pub data: Bytes,
}

/// What a provider reports back after storing a blob.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    /// Provider-internal handle for the stored content.
    pub provider_ref: String,
    pub size: u64,
    /// MIME type detected by the provider, if it reports one.
    pub mime_type: Option<String>,
    /// Direct download location, when the provider hands out a shareable one.
    pub download_url: Option<String>,
}

/// External blob storage. Bytes in, identifier out.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn store(&self, blob: Blob) -> Result<StoredBlob, ProviderError>;
    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError>;
    /// Returns `false` when the provider cannot delete content.
    async fn delete(&self, provider_ref: &str) -> Result<bool, ProviderError>;
}
