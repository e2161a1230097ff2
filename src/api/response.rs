use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::query::QueryError;

// ============================================================================
// Error body
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ============================================================================
// Unified error type for handlers
// ============================================================================

/// Handler error. `Message` renders `{"error": "..."}`; `Null` renders a bare
/// `null` body, which upload clients have always received on failure.
#[derive(Debug)]
pub enum ApiError {
    Message(StatusCode, String),
    Null(StatusCode),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Message(code, error) => (code, Json(ErrorBody { error })).into_response(),
            ApiError::Null(code) => (code, Json(serde_json::Value::Null)).into_response(),
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::UNAUTHORIZED, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::NOT_FOUND, message.into())
    }

    /// 202: the file exists but its transfer has not finished.
    pub fn not_ready(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::ACCEPTED, message.into())
    }

    /// 410: the transfer failed and the file will never become available.
    pub fn gone(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::GONE, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Message(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotFound => ApiError::not_found(e.to_string()),
            QueryError::NotReady(_) => ApiError::not_ready(e.to_string()),
            QueryError::Failed(_) => ApiError::gone(e.to_string()),
            QueryError::Provider(crate::provider::ProviderError::NotFound(_)) => {
                ApiError::not_found("File content not found")
            }
            QueryError::Provider(_) | QueryError::Database(_) => {
                tracing::error!(error = %e, "Query failed");
                ApiError::internal(e.to_string())
            }
        }
    }
}

// ============================================================================
// Custom extractors (reject with ApiError bodies)
// ============================================================================

/// Drop-in replacement for `axum::Json` that rejects with `{"error": ...}`.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                let message = match rejection {
                    JsonRejection::JsonDataError(err) => {
                        format!("Invalid request body: {}", err.body_text())
                    }
                    JsonRejection::JsonSyntaxError(_) => "Malformed JSON in request body".into(),
                    JsonRejection::MissingJsonContentType(_) => {
                        "Missing Content-Type: application/json header".into()
                    }
                    _ => "Failed to read request body".into(),
                };
                Err(ApiError::bad_request(message))
            }
        }
    }
}

/// Drop-in replacement for `axum::extract::Query` that rejects with `{"error": ...}`.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        let query = parts.uri.query().unwrap_or_default();
        serde_qs::from_str(query)
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(friendly_query_error(&e.to_string())))
    }
}

/// Translate serde/serde_qs error messages into human-friendly descriptions.
fn friendly_query_error(raw: &str) -> String {
    let cleaned = raw
        .replace("usize", "non-negative integer")
        .replace("u32", "non-negative integer")
        .replace("u64", "non-negative integer");

    format!("Invalid query parameter: {cleaned}")
}
