//! Asynchronous ingestion: accepts uploads and URL imports, registers them as
//! pending, and transfers their content to the storage provider in the
//! background.
//!
//! Request handlers only create the registry entry and enqueue a job. A
//! dispatcher hands jobs to at most `max_workers` concurrent transfer tasks;
//! each task reports its progress as [`WriteOp`]s to the
//! [`FileStateMachine`](crate::state_machine::FileStateMachine) supervisor,
//! which is the only writer of lifecycle state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{PipelineConfig, MAX_WORKERS_LIMIT};
use crate::provider::{Blob, ProviderError, StorageProvider};
use crate::state_machine::FileStateMachine;
use crate::storage::models::{Completion, FileRecord, NewFile, WriteOp};
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("Ingestion pipeline is shut down")]
    QueueClosed,
    #[error("Registry error: {0}")]
    Database(#[from] DatabaseError),
}

impl IngestError {
    /// Whether the error was caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IngestError::Validation(_) | IngestError::TooLarge { .. })
    }
}

/// Failure of a single background transfer, recorded as the file's error.
#[derive(Debug, Error)]
enum TransferError {
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("Remote file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("{0}")]
    Provider(#[from] ProviderError),
}

/// A direct upload as received from a client.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: Option<String>,
    pub data: Bytes,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A request to import a file from a remote URL.
#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub url: String,
    pub filename: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Most `files` fields a single batch upload may carry.
pub const MAX_BATCH_FILES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub file_ids: Vec<String>,
    pub errors: Vec<BatchError>,
}

enum JobSource {
    Upload(Bytes),
    Url(String),
}

struct Job {
    file_id: String,
    filename: String,
    mime_type: Option<String>,
    source: JobSource,
}

pub struct Pipeline {
    db: Database,
    max_upload_size: u64,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawn the dispatcher and the write supervisor. Must be called from
    /// within a tokio runtime.
    pub fn start(
        db: Database,
        provider: Arc<dyn StorageProvider>,
        config: &PipelineConfig,
        public_base_url: &str,
    ) -> Result<Self, anyhow::Error> {
        anyhow::ensure!(
            (1..=MAX_WORKERS_LIMIT).contains(&config.max_workers),
            "max_workers must be between 1 and {MAX_WORKERS_LIMIT}"
        );
        let max_workers = u32::try_from(config.max_workers)?;
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_size);
        let (ops_tx, ops_rx) = mpsc::channel(config.queue_size);

        let transfer = Arc::new(Transfer {
            db: db.clone(),
            provider,
            client: reqwest::Client::builder().build()?,
            max_upload_size: config.max_upload_size,
            timeout: config.transfer_timeout,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        });

        let supervisor = tokio::spawn(FileStateMachine::new(db.clone()).run(ops_rx));
        let dispatcher = tokio::spawn(dispatch(jobs_rx, transfer, ops_tx, max_workers));

        tracing::info!(
            max_workers = config.max_workers,
            queue_size = config.queue_size,
            timeout_secs = config.transfer_timeout.as_secs(),
            "Ingestion pipeline started"
        );

        Ok(Self {
            db,
            max_upload_size: config.max_upload_size,
            jobs: Mutex::new(Some(jobs_tx)),
            tasks: tokio::sync::Mutex::new(vec![dispatcher, supervisor]),
        })
    }

    /// Register a direct upload and schedule its transfer.
    pub async fn submit_upload(&self, req: UploadRequest) -> Result<FileRecord, IngestError> {
        let filename = sanitize_filename(&req.filename)
            .ok_or_else(|| IngestError::Validation("filename is required".to_string()))?;
        if req.data.is_empty() {
            return Err(IngestError::Validation(format!("{filename} is empty")));
        }
        let size = req.data.len() as u64;
        if size > self.max_upload_size {
            return Err(IngestError::TooLarge {
                size,
                limit: self.max_upload_size,
            });
        }

        let mime_type = req
            .mime_type
            .as_deref()
            .and_then(normalize_mime)
            .or_else(|| guess_mime(&filename));

        let jobs = self.sender()?;
        let file = self.db.create_file(NewFile {
            filename: filename.clone(),
            mime_type: mime_type.clone(),
            source_url: None,
            metadata: req.metadata,
        })?;

        self.enqueue(
            jobs,
            Job {
                file_id: file.file_id.clone(),
                filename,
                mime_type,
                source: JobSource::Upload(req.data),
            },
        )
        .await?;

        tracing::info!(
            file_id = %file.file_id,
            filename = %file.filename,
            size,
            file_type = %file.file_type,
            "Upload accepted"
        );
        Ok(file)
    }

    /// Register a URL import and schedule the fetch and transfer.
    pub async fn submit_import(&self, req: ImportRequest) -> Result<FileRecord, IngestError> {
        let url = reqwest::Url::parse(req.url.trim())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| {
                IngestError::Validation("url must be an absolute http(s) URL".to_string())
            })?;

        let filename = req
            .filename
            .as_deref()
            .and_then(sanitize_filename)
            .or_else(|| filename_from_url(&url))
            .unwrap_or_else(|| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("download_{}", &id[..8])
            });
        let mime_type = guess_mime(&filename);

        let jobs = self.sender()?;
        let file = self.db.create_file(NewFile {
            filename: filename.clone(),
            mime_type: mime_type.clone(),
            source_url: Some(url.to_string()),
            metadata: req.metadata,
        })?;

        self.enqueue(
            jobs,
            Job {
                file_id: file.file_id.clone(),
                filename,
                mime_type,
                source: JobSource::Url(url.to_string()),
            },
        )
        .await?;

        tracing::info!(file_id = %file.file_id, url = %url, "URL import accepted");
        Ok(file)
    }

    /// Submit each upload independently. Items that fail validation are
    /// reported in `errors` and never reach the registry.
    pub async fn submit_batch(&self, uploads: Vec<UploadRequest>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for upload in uploads {
            let filename = upload.filename.clone();
            match self.submit_upload(upload).await {
                Ok(file) => outcome.file_ids.push(file.file_id),
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "Batch item rejected");
                    outcome.errors.push(BatchError {
                        filename,
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// Stop accepting jobs and wait for in-flight transfers and their writes.
    pub async fn shutdown(&self) {
        let sender = self.jobs.lock().ok().and_then(|mut jobs| jobs.take());
        drop(sender);

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
        tracing::info!("Ingestion pipeline stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, IngestError> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.clone())
            .ok_or(IngestError::QueueClosed)
    }

    async fn enqueue(&self, jobs: mpsc::Sender<Job>, job: Job) -> Result<(), IngestError> {
        let file_id = job.file_id.clone();
        if jobs.send(job).await.is_err() {
            // The supervisor is gone too, so the record is failed here.
            let op = WriteOp::Fail {
                file_id: file_id.clone(),
                reason: "ingestion pipeline shut down before the transfer started".to_string(),
            };
            if let Err(e) = FileStateMachine::new(self.db.clone()).apply(&op) {
                tracing::error!(file_id = %file_id, error = %e, "Failed to fail orphaned job");
            }
            return Err(IngestError::QueueClosed);
        }
        Ok(())
    }
}

async fn dispatch(
    mut jobs: mpsc::Receiver<Job>,
    transfer: Arc<Transfer>,
    ops: mpsc::Sender<WriteOp>,
    max_workers: u32,
) {
    let semaphore = Arc::new(Semaphore::new(max_workers as usize));

    while let Some(job) = jobs.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let transfer = Arc::clone(&transfer);
        let ops = ops.clone();

        tokio::spawn(async move {
            let _permit = permit;
            transfer.run(job, ops).await;
        });
    }

    // Wait for in-flight transfers before the supervisor is allowed to stop.
    let _ = semaphore.acquire_many(max_workers).await;
}

struct Transfer {
    db: Database,
    provider: Arc<dyn StorageProvider>,
    client: reqwest::Client,
    max_upload_size: u64,
    timeout: Duration,
    public_base_url: String,
}

impl Transfer {
    async fn run(&self, job: Job, ops: mpsc::Sender<WriteOp>) {
        let file_id = job.file_id.clone();

        match self.db.get_file(&file_id) {
            Ok(None) => {
                tracing::debug!(file_id = %file_id, "File deleted before transfer started");
                return;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(file_id = %file_id, error = %e, "Could not read file before transfer");
            }
        }

        let processing = WriteOp::MarkProcessing {
            file_id: file_id.clone(),
        };
        if ops.send(processing).await.is_err() {
            tracing::error!(file_id = %file_id, "Write supervisor stopped, dropping job");
            return;
        }

        let start = Instant::now();
        let op = match tokio::time::timeout(self.timeout, self.transfer(&job)).await {
            Ok(Ok(completion)) => {
                tracing::info!(
                    file_id = %file_id,
                    size = completion.size,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Transfer completed"
                );
                WriteOp::Complete {
                    file_id: file_id.clone(),
                    completion,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(file_id = %file_id, error = %e, "Transfer failed");
                WriteOp::Fail {
                    file_id: file_id.clone(),
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                tracing::error!(file_id = %file_id, timeout_secs = self.timeout.as_secs(), "Transfer timed out");
                WriteOp::Fail {
                    file_id: file_id.clone(),
                    reason: format!("transfer timed out after {}s", self.timeout.as_secs()),
                }
            }
        };

        if ops.send(op).await.is_err() {
            tracing::error!(file_id = %file_id, "Write supervisor stopped, result lost");
        }
    }

    async fn transfer(&self, job: &Job) -> Result<Completion, TransferError> {
        let (data, fetched_mime) = match &job.source {
            JobSource::Upload(data) => (data.clone(), None),
            JobSource::Url(url) => self.fetch(url).await?,
        };

        let declared_mime = fetched_mime.or_else(|| job.mime_type.clone());
        let stored = self
            .provider
            .store(Blob {
                filename: job.filename.clone(),
                mime_type: declared_mime.clone(),
                data,
            })
            .await?;

        let view_url = format!("{}/view/{}", self.public_base_url, job.file_id);
        let download_url = stored
            .download_url
            .unwrap_or_else(|| format!("{view_url}?download=true"));

        Ok(Completion {
            provider_ref: stored.provider_ref,
            size: stored.size,
            mime_type: stored
                .mime_type
                .as_deref()
                .and_then(normalize_mime)
                .or(declared_mime),
            view_url,
            download_url,
        })
    }

    async fn fetch(&self, url: &str) -> Result<(Bytes, Option<String>), TransferError> {
        let limit = self.max_upload_size;
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::Fetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TransferError::Fetch(format!("{url} returned {}", resp.status())));
        }
        if let Some(size) = resp.content_length() {
            if size > limit {
                return Err(TransferError::TooLarge { size, limit });
            }
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_mime);

        let mut buf = BytesMut::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| TransferError::Fetch(e.to_string()))?
        {
            let size = (buf.len() + chunk.len()) as u64;
            if size > limit {
                return Err(TransferError::TooLarge { size, limit });
            }
            buf.extend_from_slice(&chunk);
        }

        if buf.is_empty() {
            return Err(TransferError::Fetch(format!("{url} returned an empty body")));
        }
        Ok((buf.freeze(), content_type))
    }
}

/// Strip parameters and drop the uninformative `application/octet-stream`.
fn normalize_mime(mime: &str) -> Option<String> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if essence.is_empty() || essence == "application/octet-stream" || !essence.contains('/') {
        return None;
    }
    Some(essence)
}

fn guess_mime(filename: &str) -> Option<String> {
    mime_guess::from_path(filename).first().map(|m| m.to_string())
}

/// Reduce a client-supplied name to its last path component, keeping only
/// alphanumerics and `._-`. Whitespace becomes `_`.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn filename_from_url(url: &reqwest::Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .and_then(sanitize_filename)
}
