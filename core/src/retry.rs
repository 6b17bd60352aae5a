//! Bounded retry with exponential backoff and jitter.
//!
//! # Design
//! `retry` is an explicit loop over attempt numbers. Each invocation owns its
//! counter; nothing is shared between calls. A failure is retried when it
//! carried no response at all, or when its status is in the policy's
//! retryable set. After the last attempt the final failure is returned as-is.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Statuses retried when a policy does not list its own.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Upper bound of the jitter fraction added to each delay.
const MAX_JITTER: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn should_retry<E: RetryableFailure>(&self, failure: &E) -> bool {
        if failure.is_aborted() {
            return false;
        }
        match failure.status() {
            None => true,
            Some(status) => self.retryable_status_codes.contains(&status),
        }
    }

    /// Delay before retry `attempt` (1-based), with a random jitter fraction.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay_ms, attempt, rand::random::<f64>() * MAX_JITTER)
    }
}

/// `base * 2^(attempt-1) * (1 + jitter)`.
pub fn backoff_delay(base_delay_ms: u64, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let millis = base_delay_ms as f64 * 2f64.powi(exponent as i32) * (1.0 + jitter);
    Duration::from_micros((millis * 1000.0).round() as u64)
}

/// What the retry loop needs to know about a failure.
pub trait RetryableFailure {
    /// HTTP status of the response, `None` when no response was received.
    fn status(&self) -> Option<u16>;

    /// The caller gave up; never retried.
    fn is_aborted(&self) -> bool {
        false
    }
}

/// Run `op` up to `1 + max_retries` times. `op` receives the 0-based attempt.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: RetryableFailure + std::fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let failure = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if !policy.should_retry(&failure) {
            return Err(failure);
        }
        if attempt >= policy.max_retries {
            warn!(
                attempts = attempt + 1,
                status = ?failure.status(),
                "retries exhausted"
            );
            return Err(failure);
        }

        attempt += 1;
        let delay = policy.delay_for(attempt);
        debug!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            status = ?failure.status(),
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}
