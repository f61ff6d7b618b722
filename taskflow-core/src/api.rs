//! Request/response contract for the HTTP layer.
//!
//! The client does not ship an HTTP implementation; callers plug one in
//! through [`HttpClient`]. Everything coming back is interpreted against the
//! server's standard error shape `{code, message, details}`.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entity::{Entity, EntityKey};

/// The server's error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Accepts either the bare shape or one wrapped in `{"error": {...}}`.
    pub fn from_body(body: &Value) -> Option<Self> {
        let candidate = body.get("error").unwrap_or(body);
        serde_json::from_value(candidate.clone()).ok()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Fixed request-failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    BadInput,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    Server,
    Internal,
}

impl ErrorCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorCategory::BadInput,
            401 => ErrorCategory::Unauthorized,
            403 => ErrorCategory::Forbidden,
            404 => ErrorCategory::NotFound,
            429 => ErrorCategory::RateLimited,
            500..=599 => ErrorCategory::Server,
            _ => ErrorCategory::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::BadInput => "bad_input",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Server => "server_error",
            ErrorCategory::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{category}: {error}")]
pub struct RequestError {
    pub category: ErrorCategory,
    pub error: ApiError,
}

impl RequestError {
    pub fn new(category: ErrorCategory, error: ApiError) -> Self {
        Self { category, error }
    }

    /// Map a non-success response. Bodies that do not follow the standard
    /// shape get a synthesized error named after the category.
    pub fn from_status(status: u16, body: &Value) -> Self {
        let category = ErrorCategory::from_status(status);
        let error = ApiError::from_body(body).unwrap_or_else(|| {
            ApiError::new(category.as_str(), format!("request failed with status {status}"))
        });
        Self { category, error }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Internal,
            ApiError::new(ErrorCategory::Internal.as_str(), message),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Query-string pairs; encoding is the client's job.
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_result(self) -> Result<Value, RequestError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(RequestError::from_status(self.status, &self.body))
        }
    }
}

/// The HTTP collaborator. Network failures surface as `Internal` errors.
pub trait HttpClient: Send + Sync {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> BoxFuture<'_, Result<Response, RequestError>>;
}

/// `GET /{collection}/{id}`, parsed into an [`Entity`].
pub async fn fetch_entity<C>(client: &C, key: &EntityKey) -> Result<Entity, RequestError>
where
    C: HttpClient + ?Sized,
{
    let path = format!("/{}/{}", key.kind.collection(), key.id);
    let body = client
        .request(Method::Get, &path, None, RequestOptions::default())
        .await?
        .into_result()?;
    // Some endpoints wrap the record as `{"data": {...}}`.
    let record = body.get("data").unwrap_or(&body);
    Entity::from_payload(key.kind, record)
        .map_err(|e| RequestError::internal(format!("malformed {} payload: {e}", key.kind)))
}
