//! Client configuration.
//!
//! All fields have defaults, so a JSON document only needs to name what it
//! changes:
//!
//! ```json
//! { "baseUrl": "https://api.example.com", "retry": { "maxRetries": 5 } }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// TTL for GET responses that carry no cache directive of their own.
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Prepended to every request path. Empty means paths are used as-is.
    pub base_url: String,
    pub default_cache_ttl_ms: u64,
    /// Per-attempt deadline; `None` disables it.
    pub request_timeout_ms: Option<u64>,
    pub cache_enabled: bool,
    pub default_headers: BTreeMap<String, String>,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
            cache_enabled: true,
            default_headers: BTreeMap::from([(
                "accept".to_string(),
                "application/json".to_string(),
            )]),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_cache_ttl_ms = duration_ms(ttl);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.default_cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Ok(());
        }
        let parsed = url::Url::parse(&self.base_url).map_err(|e| ConfigError::BaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::BaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
