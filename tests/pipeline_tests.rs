use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use file_relay::config::PipelineConfig;
use file_relay::pipeline::{ImportRequest, IngestError, Pipeline, UploadRequest};
use file_relay::provider::{Blob, LocalProvider, ProviderError, StorageProvider, StoredBlob};
use file_relay::query::{QueryError, QueryService};
use file_relay::storage::models::{FileRecord, FileStatus, FileType};
use file_relay::storage::Database;

const BASE_URL: &str = "http://relay.test";

/// Provider whose `store` calls block until the test releases them.
struct GatedProvider {
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl StorageProvider for GatedProvider {
    async fn store(&self, blob: Blob) -> Result<StoredBlob, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let permit = self.gate.acquire().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        permit
            .map_err(|e| ProviderError::Backend(e.to_string()))?
            .forget();

        Ok(StoredBlob {
            provider_ref: uuid::Uuid::new_v4().simple().to_string(),
            size: blob.data.len() as u64,
            mime_type: None,
            download_url: None,
        })
    }

    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError> {
        Err(ProviderError::NotFound(provider_ref.to_string()))
    }

    async fn delete(&self, _provider_ref: &str) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

/// Provider that rejects every upload.
struct FailingProvider;

#[async_trait]
impl StorageProvider for FailingProvider {
    async fn store(&self, _blob: Blob) -> Result<StoredBlob, ProviderError> {
        Err(ProviderError::Rejected("chat not found".to_string()))
    }

    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError> {
        Err(ProviderError::NotFound(provider_ref.to_string()))
    }

    async fn delete(&self, _provider_ref: &str) -> Result<bool, ProviderError> {
        Ok(false)
    }
}

fn pipeline_config(max_workers: usize, timeout: Duration) -> PipelineConfig {
    PipelineConfig {
        max_upload_size: 1024,
        max_workers,
        queue_size: 16,
        transfer_timeout: timeout,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: Database,
    pipeline: Pipeline,
    query: QueryService,
}

fn harness(provider: Arc<dyn StorageProvider>, config: PipelineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let pipeline = Pipeline::start(db.clone(), Arc::clone(&provider), &config, BASE_URL).unwrap();
    let query = QueryService::new(db.clone(), provider);
    Harness {
        _dir: dir,
        db,
        pipeline,
        query,
    }
}

fn upload(filename: &str, data: &'static str) -> UploadRequest {
    UploadRequest {
        filename: filename.to_string(),
        mime_type: None,
        data: Bytes::from(data),
        ..Default::default()
    }
}

async fn wait_for(db: &Database, file_id: &str, status: FileStatus) -> FileRecord {
    for _ in 0..500 {
        if let Some(file) = db.get_file(file_id).unwrap() {
            if file.status == status {
                return file;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("file {file_id} never reached {status}");
}

/// Serve `app` on an ephemeral local port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

/// Answer every request with a chunked body of `chunks` pieces of
/// `chunk_size` bytes and no Content-Length.
async fn serve_chunked(chunks: usize, chunk_size: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            let mut response = b"HTTP/1.1 200 OK\r\n\
                Content-Type: application/octet-stream\r\n\
                Transfer-Encoding: chunked\r\n\
                Connection: close\r\n\r\n"
                .to_vec();
            for _ in 0..chunks {
                response.extend_from_slice(format!("{chunk_size:x}\r\n").as_bytes());
                response.extend(std::iter::repeat(b'x').take(chunk_size));
                response.extend_from_slice(b"\r\n");
            }
            response.extend_from_slice(b"0\r\n\r\n");
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{addr}")
}

fn import(url: String) -> ImportRequest {
    ImportRequest {
        url,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_upload_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(dir.path()).unwrap());
    let h = harness(provider, pipeline_config(2, Duration::from_secs(5)));

    let file = h.pipeline.submit_upload(upload("cover.png", "not really a png")).await.unwrap();
    assert_eq!(file.status, FileStatus::Pending);
    assert_eq!(file.file_type, FileType::Image);

    let done = wait_for(&h.db, &file.file_id, FileStatus::Completed).await;
    assert_eq!(done.size, 16);
    assert_eq!(done.mime_type.as_deref(), Some("image/png"));
    assert_eq!(
        done.view_url.as_deref(),
        Some(format!("{BASE_URL}/view/{}", file.file_id).as_str())
    );
    assert_eq!(
        h.query.download_url(&file.file_id).unwrap(),
        format!("{BASE_URL}/view/{}?download=true", file.file_id)
    );

    let (_, content) = h.query.content(&file.file_id).await.unwrap();
    assert_eq!(content, Bytes::from("not really a png"));
}

#[tokio::test]
async fn test_processing_is_observable() {
    let provider = GatedProvider::new();
    let h = harness(provider.clone(), pipeline_config(2, Duration::from_secs(5)));

    let file = h.pipeline.submit_upload(upload("a.mp3", "audio")).await.unwrap();
    wait_for(&h.db, &file.file_id, FileStatus::Processing).await;

    let info = h.query.info(&file.file_id).unwrap();
    assert_eq!(info.status, FileStatus::Processing);
    assert!(matches!(
        h.query.view_url(&file.file_id),
        Err(QueryError::NotReady(FileStatus::Processing))
    ));

    provider.release(1);
    wait_for(&h.db, &file.file_id, FileStatus::Completed).await;
    assert!(h.query.view_url(&file.file_id).is_ok());
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let provider = GatedProvider::new();
    let h = harness(provider.clone(), pipeline_config(2, Duration::from_secs(5)));

    let mut ids = Vec::new();
    for i in 0..5 {
        let file = h
            .pipeline
            .submit_upload(upload(&format!("f{i}.txt"), "data"))
            .await
            .unwrap();
        ids.push(file.file_id);
    }

    for _ in 0..100 {
        if provider.in_flight.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = h.db.stats().unwrap();
    assert_eq!(stats.count(FileStatus::Processing), 2);
    assert_eq!(stats.count(FileStatus::Pending), 3);

    provider.release(5);
    for id in &ids {
        wait_for(&h.db, id, FileStatus::Completed).await;
    }
    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_provider_failure_marks_failed() {
    let h = harness(Arc::new(FailingProvider), pipeline_config(1, Duration::from_secs(5)));

    let file = h.pipeline.submit_upload(upload("a.txt", "data")).await.unwrap();
    let failed = wait_for(&h.db, &file.file_id, FileStatus::Failed).await;

    let reason = failed.error.unwrap();
    assert!(reason.contains("chat not found"), "{reason}");
    assert!(failed.view_url.is_none());
    assert!(matches!(h.query.view_url(&file.file_id), Err(QueryError::Failed(_))));
}

#[tokio::test]
async fn test_transfer_timeout_marks_failed() {
    let provider = GatedProvider::new();
    let h = harness(provider.clone(), pipeline_config(1, Duration::from_millis(100)));

    let file = h.pipeline.submit_upload(upload("slow.mp4", "video")).await.unwrap();
    let failed = wait_for(&h.db, &file.file_id, FileStatus::Failed).await;
    assert!(failed.error.unwrap().contains("timed out"));

    // A late release cannot resurrect the file
    provider.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.db.get_file(&file.file_id).unwrap().unwrap().status, FileStatus::Failed);
}

#[tokio::test]
async fn test_delete_during_transfer() {
    let provider = GatedProvider::new();
    let h = harness(provider.clone(), pipeline_config(1, Duration::from_secs(5)));

    let file = h.pipeline.submit_upload(upload("a.txt", "data")).await.unwrap();
    wait_for(&h.db, &file.file_id, FileStatus::Processing).await;

    h.query.delete(&file.file_id).await.unwrap();
    provider.release(1);
    h.pipeline.shutdown().await;

    assert!(h.db.get_file(&file.file_id).unwrap().is_none());
    assert_eq!(h.db.stats().unwrap().total_files, 0);
    assert!(matches!(h.query.info(&file.file_id), Err(QueryError::NotFound)));
}

#[tokio::test]
async fn test_batch_with_empty_item() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(dir.path()).unwrap());
    let h = harness(provider, pipeline_config(2, Duration::from_secs(5)));

    let outcome = h
        .pipeline
        .submit_batch(vec![
            upload("one.txt", "1"),
            upload("empty.txt", ""),
            upload("two.txt", "2"),
        ])
        .await;

    assert_eq!(outcome.file_ids.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].filename, "empty.txt");
    assert_eq!(h.db.stats().unwrap().total_files, 2);

    for id in &outcome.file_ids {
        wait_for(&h.db, id, FileStatus::Completed).await;
    }
}

#[tokio::test]
async fn test_upload_validation() {
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));

    let err = h.pipeline.submit_upload(upload("", "data")).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(_)));

    let err = h.pipeline.submit_upload(upload("a.txt", "")).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(_)));

    let big = UploadRequest {
        filename: "big.bin".to_string(),
        data: Bytes::from(vec![0u8; 2048]),
        ..Default::default()
    };
    let err = h.pipeline.submit_upload(big).await.unwrap_err();
    assert!(matches!(err, IngestError::TooLarge { size: 2048, limit: 1024 }));
    assert!(err.is_client_error());

    assert_eq!(h.db.stats().unwrap().total_files, 0);
}

#[tokio::test]
async fn test_unreachable_import_fails() {
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));

    let file = h
        .pipeline
        .submit_import(ImportRequest {
            url: "http://127.0.0.1:1/track.mp3".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(file.filename, "track.mp3");
    assert_eq!(file.source_url.as_deref(), Some("http://127.0.0.1:1/track.mp3"));

    let failed = wait_for(&h.db, &file.file_id, FileStatus::Failed).await;
    assert!(failed.error.unwrap().starts_with("Fetch failed"));
    assert!(matches!(h.query.download_url(&file.file_id), Err(QueryError::Failed(_))));
}

#[tokio::test]
async fn test_import_rejects_non_http_urls() {
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));

    for url in ["ftp://example.com/a.mp3", "not a url", ""] {
        let err = h
            .pipeline
            .submit_import(ImportRequest {
                url: url.to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)), "{url}");
    }
    assert_eq!(h.db.stats().unwrap().total_files, 0);
}

#[tokio::test]
async fn test_submit_after_shutdown() {
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));
    h.pipeline.shutdown().await;

    let err = h.pipeline.submit_upload(upload("a.txt", "data")).await.unwrap_err();
    assert!(matches!(err, IngestError::QueueClosed));
    assert_eq!(h.db.stats().unwrap().total_files, 0);
}

#[tokio::test]
async fn test_import_prefers_response_content_type() {
    let base = serve(Router::new().route(
        "/voice.mp3",
        get(|| async { ([(header::CONTENT_TYPE, "audio/ogg; codecs=opus")], "OggS data") }),
    ))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(dir.path()).unwrap());
    let h = harness(provider, pipeline_config(1, Duration::from_secs(5)));

    let url = format!("{base}/voice.mp3");
    let file = h.pipeline.submit_import(import(url.clone())).await.unwrap();
    assert_eq!(file.filename, "voice.mp3");

    let done = wait_for(&h.db, &file.file_id, FileStatus::Completed).await;
    assert_eq!(done.size, 9);
    assert_eq!(done.mime_type.as_deref(), Some("audio/ogg"));
    assert_eq!(done.file_type, FileType::Audio);
    assert_eq!(done.source_url.as_deref(), Some(url.as_str()));

    let (_, content) = h.query.content(&file.file_id).await.unwrap();
    assert_eq!(content, Bytes::from("OggS data"));
}

#[tokio::test]
async fn test_import_over_declared_length_fails() {
    let base = serve(Router::new().route("/big.bin", get(|| async { vec![7u8; 2048] }))).await;
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));

    let file = h.pipeline.submit_import(import(format!("{base}/big.bin"))).await.unwrap();
    let failed = wait_for(&h.db, &file.file_id, FileStatus::Failed).await;
    assert_eq!(
        failed.error.as_deref(),
        Some("Remote file too large: 2048 bytes exceeds the 1024 byte limit")
    );
}

#[tokio::test]
async fn test_import_over_streamed_length_fails() {
    let base = serve_chunked(4, 512).await;
    let h = harness(GatedProvider::new(), pipeline_config(1, Duration::from_secs(5)));

    let file = h.pipeline.submit_import(import(format!("{base}/stream.bin"))).await.unwrap();
    let failed = wait_for(&h.db, &file.file_id, FileStatus::Failed).await;
    let reason = failed.error.unwrap();
    assert!(reason.starts_with("Remote file too large"), "{reason}");
    assert!(reason.ends_with("exceeds the 1024 byte limit"), "{reason}");
}

#[tokio::test]
async fn test_import_streamed_within_limit() {
    let base = serve_chunked(2, 100).await;
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(dir.path()).unwrap());
    let h = harness(provider, pipeline_config(1, Duration::from_secs(5)));

    let file = h.pipeline.submit_import(import(format!("{base}/stream.bin"))).await.unwrap();
    let done = wait_for(&h.db, &file.file_id, FileStatus::Completed).await;
    assert_eq!(done.size, 200);

    let (_, content) = h.query.content(&file.file_id).await.unwrap();
    assert_eq!(content, Bytes::from(vec![b'x'; 200]));
}

#[tokio::test]
async fn test_start_rejects_out_of_range_worker_counts() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();

    for workers in [0, file_relay::config::MAX_WORKERS_LIMIT + 1, usize::MAX] {
        let result = Pipeline::start(
            db.clone(),
            GatedProvider::new(),
            &pipeline_config(workers, Duration::from_secs(5)),
            BASE_URL,
        );
        assert!(result.is_err(), "{workers}");
    }
}
