//! The client facade: verb methods and registry-driven endpoint calls.
//!
//! # Design
//! A GET goes through four stages: cache lookup, in-flight coalescing,
//! network with retry, then cache population. Mutating verbs skip the first
//! two and always hit the network; on success they invalidate the cached
//! entry (and its query variants) for the target path.
//!
//! Each `ApiClient` owns its own cache and pending-call map. Nothing is
//! global, and two clients never observe each other's invalidations.
//!
//! Cancellation is per caller. A caller whose signal fires stops waiting and
//! gets a cancelled `ApiError`; a coalesced GET keeps running for the other
//! waiters and is dropped only once all of them have gone. An invalidation
//! that lands while a GET is in flight does not disturb that GET's waiters.
//! That GET will not write its result into the cache, and later reads of the
//! same key start a new request instead of joining it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, CacheStore};
use crate::classify::classify;
use crate::config::ClientConfig;
use crate::dedup::Deduplicator;
use crate::error::{ApiError, ErrorCategory};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::registry::{request_key, ParamValidation, Params, Registry};
use crate::retry::{retry, RetryPolicy};
use crate::transport::{RequestFailure, Transport};

/// Supplies bearer tokens for endpoints marked `requiresAuth`.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Per-attempt deadline, overriding the configured one.
    pub timeout: Option<Duration>,
    /// Extra headers; these win over defaults.
    pub headers: Vec<(String, String)>,
    /// Overrides the configured `maxRetries`.
    pub max_retries: Option<u32>,
    /// Skip the cache lookup. The response still refreshes the cache.
    pub bypass_cache: bool,
    pub signal: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Registry-derived settings for one call.
#[derive(Debug, Clone, Copy, Default)]
struct EndpointHints {
    cache_ttl: Option<Duration>,
    requires_auth: bool,
}

pub struct ApiClient {
    config: ClientConfig,
    registry: Registry,
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore<Value>>,
    dedup: Deduplicator<Value>,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url)
            .field("cached", &self.cache.len())
            .field("dedup", &self.dedup)
            .finish()
    }
}

impl ApiClient {
    pub fn new(config: ClientConfig, registry: Registry, transport: Arc<dyn Transport>) -> Self {
        Self::with_stores(config, registry, transport, CacheStore::new(), Deduplicator::new())
    }

    /// Build a client around the given stores. The client takes ownership,
    /// so stores cannot be shared between clients.
    pub fn with_stores(
        config: ClientConfig,
        registry: Registry,
        transport: Arc<dyn Transport>,
        cache: CacheStore<Value>,
        dedup: Deduplicator<Value>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            cache: Arc::new(cache),
            dedup,
            tokens: None,
        }
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore<Value> {
        &self.cache
    }

    // --- verbs ---------------------------------------------------------

    pub async fn get(&self, path: &str, query: &Params, options: RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(HttpMethod::Get, path, query, None, options, EndpointHints::default())
            .await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>, options: RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(HttpMethod::Post, path, &Params::new(), body, options, EndpointHints::default())
            .await
    }

    pub async fn put(&self, path: &str, body: Option<&Value>, options: RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(HttpMethod::Put, path, &Params::new(), body, options, EndpointHints::default())
            .await
    }

    pub async fn patch(&self, path: &str, body: Option<&Value>, options: RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(HttpMethod::Patch, path, &Params::new(), body, options, EndpointHints::default())
            .await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(HttpMethod::Delete, path, &Params::new(), None, options, EndpointHints::default())
            .await
    }

    /// Resolve `category.endpoint` through the registry and dispatch it with
    /// the endpoint's method, cache TTL and auth requirement.
    pub async fn call_endpoint(
        &self,
        category: &str,
        endpoint: &str,
        path_params: &Params,
        query: &Params,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let descriptor = self.registry.descriptor(category, endpoint)?;
        let path = self.registry.resolve(category, endpoint, path_params)?;
        let hints = EndpointHints {
            cache_ttl: descriptor.cache_ttl,
            requires_auth: descriptor.requires_auth,
        };
        self.dispatch(descriptor.method, &path, query, body, options, hints)
            .await
    }

    pub fn resolve(&self, category: &str, endpoint: &str, path_params: &Params) -> Result<String, ApiError> {
        Ok(self.registry.resolve(category, endpoint, path_params)?)
    }

    pub fn validate_params(&self, category: &str, endpoint: &str, params: &Params) -> ParamValidation {
        self.registry.validate_params(category, endpoint, params)
    }

    // --- cache administration ------------------------------------------

    /// Drop the cached entry for `url` and every query variant of it. GETs
    /// for those keys already in flight stop being joinable.
    pub fn invalidate_cache(&self, url: &str) -> usize {
        let removed = self.cache.remove_url(url);
        let detached = self.dedup.forget_url(url);
        debug!(url, removed, detached, "cache invalidated");
        removed
    }

    pub fn invalidate_cache_matching(&self, pattern: &regex::Regex) -> usize {
        let removed = self.cache.remove_pattern(pattern);
        let detached = self.dedup.forget_matching(pattern);
        debug!(pattern = pattern.as_str(), removed, detached, "cache invalidated by pattern");
        removed
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        self.dedup.clear_pending();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.dedup.is_pending(key)
    }

    /// Forget in-flight GETs so new callers start fresh requests.
    pub fn clear_pending(&self) {
        self.dedup.clear_pending();
    }

    // --- internals -----------------------------------------------------

    async fn dispatch(
        &self,
        method: HttpMethod,
        path: &str,
        query: &Params,
        body: Option<&Value>,
        options: RequestOptions,
        hints: EndpointHints,
    ) -> Result<Value, ApiError> {
        let key = request_key(path, query);

        if method.is_mutating() {
            let exchange = self.exchange(method, &key, body, &options, hints)?;
            return self.mutate(exchange, path, options.signal.as_ref()).await;
        }

        if self.config.cache_enabled && !options.bypass_cache {
            if let Some(value) = self.cache.get(&key) {
                debug!(key = %key, "cache hit");
                return Ok(value);
            }
            trace!(key = %key, "cache miss");
        }

        let exchange = self.exchange(method, &key, body, &options, hints)?;
        let default_ttl = self.config.default_cache_ttl();
        let request_id = exchange.request_id.clone();
        let call = self
            .dedup
            .join(&key, move || exchange.fetch(hints.cache_ttl, default_ttl));

        match unless_cancelled(call, options.signal.as_ref()).await {
            Some(result) => result,
            None => {
                debug!(key = %key, "caller cancelled while waiting");
                Err(classify(&RequestFailure::Cancelled)
                    .with_metadata("method", method.as_str())
                    .with_metadata("url", key)
                    .with_metadata("requestId", request_id))
            }
        }
    }

    async fn mutate(
        &self,
        exchange: Exchange,
        path: &str,
        signal: Option<&CancellationToken>,
    ) -> Result<Value, ApiError> {
        let outcome = unless_cancelled(exchange.run(false), signal)
            .await
            .unwrap_or(Err(RequestFailure::Cancelled));
        match outcome {
            Ok(response) => {
                let removed = self.cache.remove_url(path);
                let detached = self.dedup.forget_url(path);
                debug!(
                    method = %exchange.request.method,
                    path,
                    removed,
                    detached,
                    "mutation succeeded; cache invalidated"
                );
                Ok(response.json_body())
            }
            Err(failure) => Err(exchange.fail(&failure)),
        }
    }

    fn exchange(
        &self,
        method: HttpMethod,
        key: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        hints: EndpointHints,
    ) -> Result<Exchange, ApiError> {
        let url = format!("{}{}", self.config.base_url, key);
        let request_id = Uuid::new_v4().to_string();

        let mut request = HttpRequest::new(method, url);
        for (name, value) in &self.config.default_headers {
            request.set_header(name, value.as_str());
        }
        request.set_header("x-request-id", request_id.as_str());

        if hints.requires_auth {
            let token = self.tokens.as_ref().and_then(|t| t.token()).ok_or_else(|| {
                ApiError::new(ErrorCategory::Auth, false, "authentication required")
                    .with_metadata("method", method.as_str())
                    .with_metadata("url", key)
            })?;
            request.set_header("authorization", format!("Bearer {token}"));
        }

        if method.is_mutating() {
            if let Some(body) = body {
                request.set_header("content-type", "application/json");
                request.body = Some(body.to_string());
            }
        }

        for (name, value) in &options.headers {
            request.set_header(name, value.as_str());
        }

        let mut policy = self.config.retry.clone();
        if let Some(max_retries) = options.max_retries {
            policy.max_retries = max_retries;
        }

        Ok(Exchange {
            transport: Arc::clone(&self.transport),
            cache: Arc::clone(&self.cache),
            cache_enabled: self.config.cache_enabled,
            policy,
            timeout: options.timeout.or(self.config.request_timeout()),
            request,
            key: key.to_string(),
            request_id,
        })
    }
}

/// Everything one logical request needs, owned so it can run detached from
/// the caller inside a shared GET.
#[derive(Clone)]
struct Exchange {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore<Value>>,
    cache_enabled: bool,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    request: HttpRequest,
    key: String,
    request_id: String,
}

impl Exchange {
    /// GET body: network with retry, revalidation, cache population.
    async fn fetch(self, endpoint_ttl: Option<Duration>, default_ttl: Duration) -> Result<Value, ApiError> {
        let ticket = self.cache.ticket(&self.key);

        let response = match self.run(self.cache_enabled).await {
            Ok(response) if response.is_not_modified() => {
                if let Some(value) = self.cache.revalidate(&self.key) {
                    debug!(key = %self.key, "not modified; cached value revalidated");
                    return Ok(value);
                }
                debug!(key = %self.key, "not modified but cached value is gone; refetching");
                self.run(false).await
            }
            other => other,
        }
        .map_err(|failure| self.fail(&failure))?;

        let value = response.json_body();
        if self.cache_enabled {
            let directives = response.cache_directives();
            if directives.no_store {
                trace!(key = %self.key, "response marked no-store");
            } else {
                let ttl = directives.max_age.or(endpoint_ttl).unwrap_or(default_ttl);
                let etag = response.etag().map(str::to_string);
                if ticket.fill(value.clone(), ttl, etag) {
                    trace!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "cached response");
                }
            }
        }
        Ok(value)
    }

    /// Network with retry. `conditional` attaches `If-None-Match` from the
    /// cache and accepts a 304 as an answer.
    async fn run(&self, conditional: bool) -> Result<HttpResponse, RequestFailure> {
        retry(&self.policy, |attempt| {
            let mut request = self.request.clone();
            if conditional {
                if let Some(etag) = self.cache.get_etag(&self.key) {
                    request.set_header("if-none-match", etag);
                }
            }
            trace!(
                method = %request.method,
                url = %request.url,
                attempt,
                "sending request"
            );
            self.attempt(request, conditional)
        })
        .await
    }

    async fn attempt(&self, request: HttpRequest, accept_not_modified: bool) -> Result<HttpResponse, RequestFailure> {
        let call = self.transport.send(request);
        let sent = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RequestFailure::Timeout(limit))?,
            None => call.await,
        };
        let response = sent.map_err(RequestFailure::Transport)?;
        if response.is_success() || (accept_not_modified && response.is_not_modified()) {
            Ok(response)
        } else {
            Err(RequestFailure::Status(response))
        }
    }

    fn fail(&self, failure: &RequestFailure) -> ApiError {
        let error = classify(failure)
            .with_metadata("method", self.request.method.as_str())
            .with_metadata("url", self.request.url.as_str())
            .with_metadata("requestId", self.request_id.as_str());
        warn!(
            method = %self.request.method,
            url = %self.request.url,
            category = %error.category,
            status = ?error.status,
            retryable = error.retryable,
            "request failed: {}",
            error.message
        );
        error
    }
}

/// `None` when `signal` fires first. An already-cancelled signal wins.
async fn unless_cancelled<F: Future>(fut: F, signal: Option<&CancellationToken>) -> Option<F::Output> {
    match signal {
        None => Some(fut.await),
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            out = fut => Some(out),
        },
    }
}
