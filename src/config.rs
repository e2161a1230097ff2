use std::path::Path;
use std::time::Duration;

use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
    #[error("Failed to read or persist the API key: {0}")]
    Io(#[from] std::io::Error),
}

/// Largest accepted `MAX_WORKERS`.
pub const MAX_WORKERS_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    /// Shared secret expected in the `X-API-Key` header
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub service_name: String,
    /// Prefix for the view/download URLs handed to clients
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum upload size in bytes (direct uploads and URL imports)
    pub max_upload_size: u64,
    /// Upper bound on simultaneously active transfers
    pub max_workers: usize,
    /// Capacity of the job queue between request handlers and workers
    pub queue_size: usize,
    /// Overall bound on one transfer, fetch plus provider call
    pub transfer_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local,
    Telegram,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// Bot API base URL
    pub telegram_api_url: String,
    /// Bot token (required when backend is telegram)
    pub telegram_bot_token: Option<String>,
    /// Chat the bot uploads into (required when backend is telegram)
    pub telegram_chat_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
            service_name: "file-relay".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 2000 * 1024 * 1024, // 2000MB
            max_workers: 5,
            queue_size: 1000,
            transfer_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            telegram_api_url: "https://api.telegram.org".to_string(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let node_defaults = NodeConfig::default();
        let pipeline_defaults = PipelineConfig::default();
        let storage_defaults = StorageConfig::default();

        let data_dir = std::env::var("DATA_DIR").unwrap_or(node_defaults.data_dir);

        let node = NodeConfig {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or(node_defaults.bind_address),
            service_name: std::env::var("SERVICE_NAME").unwrap_or(node_defaults.service_name),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(node_defaults.public_base_url),
            data_dir,
        };

        let pipeline = PipelineConfig {
            max_upload_size: env_parse("MAX_UPLOAD_SIZE").unwrap_or(pipeline_defaults.max_upload_size),
            max_workers: env_parse("MAX_WORKERS").unwrap_or(pipeline_defaults.max_workers),
            queue_size: env_parse("QUEUE_SIZE").unwrap_or(pipeline_defaults.queue_size),
            transfer_timeout: env_parse("TRANSFER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(pipeline_defaults.transfer_timeout),
        };

        let backend = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "telegram" => StorageBackend::Telegram,
            _ => StorageBackend::Local,
        };

        let storage = StorageConfig {
            backend,
            local_storage_path: std::env::var("LOCAL_STORAGE_PATH")
                .unwrap_or(storage_defaults.local_storage_path),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or(storage_defaults.telegram_api_url),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
        };

        let api_key = match std::env::var("API_KEY") {
            Ok(key) => key,
            Err(_) => load_or_create_api_key(Path::new(&node.data_dir))?,
        };

        let config = Config {
            node,
            pipeline,
            storage,
            api_key,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "API_KEY cannot be empty".to_string(),
            ));
        }

        if self.pipeline.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_WORKERS must be at least 1".to_string(),
            ));
        }

        if self.pipeline.max_workers > MAX_WORKERS_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "MAX_WORKERS cannot exceed {MAX_WORKERS_LIMIT}"
            )));
        }

        if self.pipeline.queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "QUEUE_SIZE must be at least 1".to_string(),
            ));
        }

        if self.pipeline.transfer_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "TRANSFER_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if matches!(self.storage.backend, StorageBackend::Telegram)
            && (self.storage.telegram_bot_token.is_none()
                || self.storage.telegram_chat_id.is_none())
        {
            return Err(ConfigError::ValidationError(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID are required when STORAGE_BACKEND=telegram"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Read the API key persisted in `data_dir`, generating one on first start.
pub fn load_or_create_api_key(data_dir: &Path) -> Result<String, ConfigError> {
    let path = data_dir.join("api_key");
    if path.exists() {
        let key = std::fs::read_to_string(&path)?.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let key = generate_api_key()?;
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &key)?;
    tracing::warn!(
        path = %path.display(),
        "Generated a new API key; clients must send it in the X-API-Key header"
    );
    Ok(key)
}

fn generate_api_key() -> Result<String, ConfigError> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| ConfigError::ValidationError("system randomness unavailable".to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_api_key(dir.path()).unwrap();
        assert_eq!(first.len(), 43);

        let second = load_or_create_api_key(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn telegram_backend_requires_credentials() {
        let config = Config {
            node: NodeConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig {
                backend: StorageBackend::Telegram,
                ..Default::default()
            },
            api_key: "secret".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn max_workers_is_bounded() {
        let mut config = Config {
            node: NodeConfig::default(),
            pipeline: PipelineConfig {
                max_workers: MAX_WORKERS_LIMIT,
                ..Default::default()
            },
            storage: StorageConfig::default(),
            api_key: "secret".to_string(),
        };
        assert!(config.validate().is_ok());

        config.pipeline.max_workers = MAX_WORKERS_LIMIT + 1;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: MAX_WORKERS cannot exceed 1024"
        );

        config.pipeline.max_workers = usize::MAX;
        assert!(config.validate().is_err());
    }
}
