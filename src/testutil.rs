//! Shared test helpers for file-relay router tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::config::{Config, NodeConfig, PipelineConfig, StorageConfig};
use crate::pipeline::Pipeline;
use crate::provider::{Blob, LocalProvider, ProviderError, StorageProvider, StoredBlob};
use crate::query::QueryService;
use crate::storage::models::{FileRecord, FileStatus};
use crate::storage::Database;
use crate::AppState;

pub const TEST_API_KEY: &str = "test-api-key";

/// Create a test AppState with a temporary database and local provider.
/// Must be called from within a tokio runtime.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let files_dir = temp_dir.path().join("files");
    let provider: Arc<dyn StorageProvider> =
        Arc::new(LocalProvider::new(&files_dir).expect("Failed to create test provider"));
    test_state_with(temp_dir, provider, 10 * 1024 * 1024) // 10MB for tests
}

/// Like [`test_state`], with a caller-supplied provider and upload limit.
pub fn test_state_with(
    temp_dir: &tempfile::TempDir,
    provider: Arc<dyn StorageProvider>,
    max_upload_size: u64,
) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            service_name: "file-relay-test".to_string(),
            public_base_url: "http://relay.test".to_string(),
        },
        pipeline: PipelineConfig {
            max_upload_size,
            max_workers: 2,
            queue_size: 16,
            transfer_timeout: Duration::from_secs(10),
        },
        storage: StorageConfig {
            local_storage_path: files_dir.to_string_lossy().to_string(),
            ..StorageConfig::default()
        },
        api_key: TEST_API_KEY.to_string(),
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let pipeline = Pipeline::start(
        db.clone(),
        Arc::clone(&provider),
        &config.pipeline,
        &config.node.public_base_url,
    )
    .expect("Failed to start test pipeline");
    let query = QueryService::new(db.clone(), provider);

    Arc::new(AppState {
        config,
        db,
        pipeline,
        query,
    })
}

/// Local provider whose stores wait until the test opens the gate.
pub struct HeldProvider {
    gate: Semaphore,
    inner: LocalProvider,
}

impl HeldProvider {
    pub fn new(temp_dir: &tempfile::TempDir) -> Arc<Self> {
        let inner = LocalProvider::new(temp_dir.path().join("files"))
            .expect("Failed to create test provider");
        Arc::new(Self {
            gate: Semaphore::new(0),
            inner,
        })
    }

    /// Let `n` held stores through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl StorageProvider for HeldProvider {
    async fn store(&self, blob: Blob) -> Result<StoredBlob, ProviderError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| ProviderError::Backend(e.to_string()))?
            .forget();
        self.inner.store(blob).await
    }

    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError> {
        self.inner.fetch(provider_ref).await
    }

    async fn delete(&self, provider_ref: &str) -> Result<bool, ProviderError> {
        self.inner.delete(provider_ref).await
    }
}

/// Poll the registry until the file reaches `status`, panicking after 5s.
pub async fn wait_for_status(state: &AppState, file_id: &str, status: FileStatus) -> FileRecord {
    for _ in 0..500 {
        if let Some(file) = state.db.get_file(file_id).expect("registry read failed") {
            if file.status == status {
                return file;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("file {file_id} never reached {status}");
}
