//! Maps raw request failures onto the `ApiError` taxonomy.
//!
//! Precedence, first match wins:
//!
//! | condition               | category     | retryable |
//! |-------------------------|--------------|-----------|
//! | no response             | `NETWORK`    | yes       |
//! | 401, 403                | `AUTH`       | no        |
//! | 422                     | `VALIDATION` | no        |
//! | 429                     | `RATE_LIMIT` | yes       |
//! | >= 500                  | `SERVER`     | yes       |
//! | other 4xx               | `CLIENT`     | no        |
//! | anything else           | `UNKNOWN`    | yes       |
//!
//! A cancelled call is response-less but is reported as non-retryable, since
//! retrying would override the caller's decision to stop.

use serde_json::Value;

use crate::error::{ApiError, ErrorCategory};
use crate::transport::RequestFailure;

/// Body fields consulted for a human-readable message, in order.
const MESSAGE_FIELDS: [&str; 3] = ["message", "error", "detail"];

/// Category and retryability for a status, `None` meaning no response.
pub fn category_for_status(status: Option<u16>) -> (ErrorCategory, bool) {
    match status {
        None => (ErrorCategory::Network, true),
        Some(401 | 403) => (ErrorCategory::Auth, false),
        Some(422) => (ErrorCategory::Validation, false),
        Some(429) => (ErrorCategory::RateLimit, true),
        Some(s) if s >= 500 => (ErrorCategory::Server, true),
        Some(400..=499) => (ErrorCategory::Client, false),
        Some(_) => (ErrorCategory::Unknown, true),
    }
}

/// First non-empty `message`, `error` or `detail` field of a JSON object body.
pub fn extract_message(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    MESSAGE_FIELDS.iter().find_map(|field| match object.get(*field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    })
}

pub fn classify(failure: &RequestFailure) -> ApiError {
    match failure {
        RequestFailure::Transport(err) => {
            let (category, retryable) = category_for_status(None);
            ApiError::new(category, retryable, err.message.clone())
        }
        RequestFailure::Timeout(after) => {
            let (category, retryable) = category_for_status(None);
            ApiError::new(
                category,
                retryable,
                format!("timeout of {}ms exceeded", after.as_millis()),
            )
            .with_metadata("timeout", true)
        }
        RequestFailure::Cancelled => ApiError::new(ErrorCategory::Network, false, "request cancelled")
            .with_metadata("cancelled", true),
        RequestFailure::Status(response) => {
            let (category, retryable) = category_for_status(Some(response.status));
            let body = response.json_body();
            let message = extract_message(&body)
                .unwrap_or_else(|| format!("Request failed with status code {}", response.status));
            let mut error = ApiError::new(category, retryable, message).with_status(response.status);
            if !body.is_null() {
                error = error.with_metadata("body", body);
            }
            if let Some(retry_after) = response.header("retry-after") {
                error = error.with_metadata("retryAfter", retry_after);
            }
            error
        }
    }
}
