use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Blob, ProviderError, StorageProvider, StoredBlob};

/// Message fields that can carry the stored file, in lookup order.
const MESSAGE_FILE_FIELDS: &[&str] = &[
    "document",
    "audio",
    "voice",
    "video",
    "photo",
    "sticker",
    "animation",
    "video_note",
];

/// Telegram Bot API provider: blobs are sent as documents to a chat and
/// addressed afterwards by their Telegram `file_id`.
pub struct TelegramProvider {
    api_url: String,
    bot_token: String,
    chat_id: String,
    client: Client,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_id: String,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
}

impl TelegramProvider {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            client,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_url, self.bot_token, file_path)
    }

    async fn read_result<T: DeserializeOwned>(
        resp: reqwest::Response,
        action: &str,
    ) -> Result<T, ProviderError> {
        let status = resp.status();
        let body: ApiResponse<T> = resp.json().await.map_err(|e| {
            ProviderError::Backend(format!("Telegram {action} returned {status}: {e}"))
        })?;

        if !body.ok {
            let reason = body.description.unwrap_or_else(|| status.to_string());
            return Err(ProviderError::Rejected(format!("Telegram {action}: {reason}")));
        }
        body.result
            .ok_or_else(|| ProviderError::Backend(format!("Telegram {action}: empty result")))
    }

    async fn file_path(&self, file_id: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(ProviderError::NotFound(file_id.to_string()));
        }

        let file: TelegramFile = Self::read_result(resp, "getFile").await?;
        file.file_path
            .ok_or_else(|| ProviderError::Backend("Telegram getFile: no file_path".to_string()))
    }
}

/// Locate the stored file in a `sendDocument` reply. Photos come as an array
/// of sizes; the last one is the largest.
fn extract_file(message: &serde_json::Value) -> Option<TelegramFile> {
    MESSAGE_FILE_FIELDS.iter().find_map(|field| {
        let value = message.get(*field)?;
        let value = match value.as_array() {
            Some(sizes) => sizes.last()?,
            None => value,
        };
        serde_json::from_value(value.clone()).ok()
    })
}

#[async_trait]
impl StorageProvider for TelegramProvider {
    async fn store(&self, blob: Blob) -> Result<StoredBlob, ProviderError> {
        let size = blob.data.len() as u64;
        let mut part = Part::stream(blob.data).file_name(blob.filename.clone());
        if let Some(ref mime) = blob.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| ProviderError::Backend(format!("Invalid MIME type '{mime}': {e}")))?;
        }
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("document", part);

        tracing::debug!(filename = %blob.filename, size, "Uploading to Telegram");
        let resp = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;

        let message: serde_json::Value = Self::read_result(resp, "sendDocument").await?;
        let file = extract_file(&message).ok_or_else(|| {
            ProviderError::Backend("Telegram sendDocument: no file in message".to_string())
        })?;

        Ok(StoredBlob {
            provider_ref: file.file_id,
            size: file.file_size.unwrap_or(size),
            mime_type: file.mime_type,
            // Telegram file links embed the bot token, so they are never handed out.
            download_url: None,
        })
    }

    async fn fetch(&self, provider_ref: &str) -> Result<Bytes, ProviderError> {
        let file_path = self.file_path(provider_ref).await?;
        let resp = self.client.get(self.file_url(&file_path)).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(provider_ref.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Backend(format!(
                "Telegram download failed ({status}): {body}"
            )));
        }
        Ok(resp.bytes().await?)
    }

    async fn delete(&self, _provider_ref: &str) -> Result<bool, ProviderError> {
        // The Bot API cannot delete a file by file_id.
        Ok(false)
    }
}
