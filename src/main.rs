use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_relay::{
    api,
    config::{Config, StorageBackend},
    pipeline::Pipeline,
    provider::{LocalProvider, StorageProvider, TelegramProvider},
    query::QueryService,
    storage::Database,
    AppState,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-relay starting");

    // Load configuration
    let config = Config::load()?;
    info!(service = %config.node.service_name, "Loaded configuration");

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Initialize storage provider
    let provider: Arc<dyn StorageProvider> = match config.storage.backend {
        StorageBackend::Local => {
            let provider = LocalProvider::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                config.storage.local_storage_path
            );
            Arc::new(provider)
        }
        StorageBackend::Telegram => {
            let (Some(token), Some(chat_id)) = (
                config.storage.telegram_bot_token.as_deref(),
                config.storage.telegram_chat_id.as_deref(),
            ) else {
                anyhow::bail!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID are required for the telegram backend");
            };
            let provider = TelegramProvider::new(&config.storage.telegram_api_url, token, chat_id)?;
            info!(chat_id = %chat_id, "Using Telegram storage backend");
            Arc::new(provider)
        }
    };

    // Start the ingestion pipeline (dispatcher, workers, write supervisor)
    let pipeline = Pipeline::start(
        db.clone(),
        Arc::clone(&provider),
        &config.pipeline,
        &config.node.public_base_url,
    )?;
    let query = QueryService::new(db.clone(), provider);

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        pipeline,
        query,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight transfers finish and their results land in the registry
    info!("Draining ingestion pipeline");
    state.pipeline.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
