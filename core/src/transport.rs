//! The I/O seam between the client and the network.
//!
//! # Design
//! The client never talks to a socket itself; it hands an `HttpRequest` to a
//! `Transport` and gets an `HttpResponse` back. Any status code is a
//! response. `TransportError` is reserved for "nothing came back" (refused
//! connection, reset, DNS failure), which the retry layer always treats as
//! transient.
//!
//! `UreqTransport` is the bundled implementation: a blocking ureq agent with
//! status-as-error disabled, driven from a blocking worker thread.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ClientConfig, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::retry::RetryableFailure;

/// No response was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Raw outcome of one failed attempt, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFailure {
    /// The transport gave up without a response.
    Transport(TransportError),
    /// The attempt exceeded its deadline.
    Timeout(Duration),
    /// A response arrived with a non-success status.
    Status(HttpResponse),
    /// The caller's cancellation signal fired.
    Cancelled,
}

impl RetryableFailure for RequestFailure {
    fn status(&self) -> Option<u16> {
        match self {
            RequestFailure::Status(response) => Some(response.status),
            _ => None,
        }
    }

    fn is_aborted(&self) -> bool {
        matches!(self, RequestFailure::Cancelled)
    }
}

/// Blocking `ureq` agent run on tokio's blocking pool.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
    timeout: Option<Duration>,
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)))
    }
}

impl UreqTransport {
    /// `timeout` bounds the whole exchange at the agent level, so a worker
    /// thread abandoned by the client's per-attempt deadline still ends.
    pub fn new(timeout: Option<Duration>) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout)
            .build()
            .new_agent();
        Self { agent, timeout }
    }

    /// Agent bounded by the client's request timeout.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.request_timeout())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl Transport for UreqTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&agent, request))
            .await
            .map_err(|e| TransportError::new(format!("transport worker failed: {e}")))?
    }
}

fn execute_blocking(agent: &ureq::Agent, req: HttpRequest) -> Result<HttpResponse, TransportError> {
    let body = req.body.unwrap_or_default();
    let result = match req.method {
        HttpMethod::Get => {
            let mut builder = agent.get(&req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            builder.call()
        }
        HttpMethod::Delete => {
            let mut builder = agent.delete(&req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            builder.call()
        }
        HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => {
            let mut builder = match req.method {
                HttpMethod::Post => agent.post(&req.url),
                HttpMethod::Put => agent.put(&req.url),
                _ => agent.patch(&req.url),
            };
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            builder.send(body.as_bytes())
        }
    };

    let mut response = result.map_err(|e| TransportError::new(e.to_string()))?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| TransportError::new(format!("reading response body: {e}")))?;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
