//! Error types for the API client.
//!
//! # Design
//! Every failed call surfaces to the caller as exactly one `ApiError`, built
//! by `classify` from whatever went wrong underneath. The category tells the
//! consumer how to react (re-authenticate, show a validation message, back
//! off) without inspecting status codes or parsing messages.
//!
//! Registry lookups fail with the tagged `ResolveError` so callers can branch
//! on the variant; the facade folds those into `ApiError` as well.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Failure taxonomy shared by all callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// No response was received.
    Network,
    /// 401 or 403.
    Auth,
    /// 422.
    Validation,
    /// 429.
    RateLimit,
    /// 5xx.
    Server,
    /// Any other 4xx.
    Client,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Server => "SERVER",
            ErrorCategory::Client => "CLIENT",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure. Never mutated once returned to a caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub metadata: Map<String, Value>,
}

impl ApiError {
    pub fn new(category: ErrorCategory, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            category,
            retryable,
            metadata: Map::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The caller's own cancellation signal fired before a result arrived.
    pub fn is_cancelled(&self) -> bool {
        self.metadata.get("cancelled") == Some(&Value::Bool(true))
    }
}

/// Failures resolving a (category, endpoint) pair into a URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown endpoint category: {0}")]
    UnknownCategory(String),

    #[error("unknown endpoint: {category}.{endpoint}")]
    UnknownEndpoint { category: String, endpoint: String },

    #[error("missing required path parameter: {0}")]
    MissingParameter(String),
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let message = err.to_string();
        let error = ApiError::new(ErrorCategory::Client, false, message);
        match err {
            ResolveError::UnknownCategory(category) => error
                .with_metadata("kind", "unknown_category")
                .with_metadata("category", category),
            ResolveError::UnknownEndpoint { category, endpoint } => error
                .with_metadata("kind", "unknown_endpoint")
                .with_metadata("category", category)
                .with_metadata("endpoint", endpoint),
            ResolveError::MissingParameter(name) => error
                .with_metadata("kind", "missing_parameter")
                .with_metadata("parameter", name),
        }
    }
}

/// Malformed client configuration or registry document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base URL {url:?}: {reason}")]
    BaseUrl { url: String, reason: String },
}
