//! Resilient API client core.
//!
//! # Overview
//! Turns a logical `(category, endpoint, params)` request into a network
//! call, with a response cache, coalescing of identical in-flight GETs,
//! retry with exponential backoff, and a single classified error type.
//!
//! # Design
//! - `registry` resolves endpoint descriptors into concrete paths.
//! - `cache` and `dedup` are plain owned stores; each `ApiClient` builds or
//!   receives its own.
//! - `retry` is a stateless loop; `classify` turns whatever failed into an
//!   `ApiError`.
//! - The network sits behind the `Transport` trait. The crate ships a
//!   `ureq`-backed implementation, and tests plug in scripted ones.

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod http;
pub mod registry;
pub mod retry;
pub mod transport;

pub use cache::{CacheStats, CacheStore, EntryStats};
pub use classify::classify;
pub use client::{ApiClient, RequestOptions, TokenSource};
pub use config::ClientConfig;
pub use dedup::Deduplicator;
pub use error::{ApiError, ConfigError, ErrorCategory, ResolveError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use registry::{params, EndpointDescriptor, Lookup, ParamValidation, Params, Registry};
pub use retry::{retry, RetryPolicy, RetryableFailure};
pub use transport::{RequestFailure, Transport, TransportError, UreqTransport};

pub use tokio_util::sync::CancellationToken;
