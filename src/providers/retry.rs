//! Retry and backoff helpers
//!
//! - `BackoffConfig::delay()`: exponential backoff with optional jitter,
//!   shared by callback delivery and backend calls
//! - `send_with_retry()`: HTTP send with 429/5xx handling and Retry-After
//!   support, for idempotent backend requests only
//! - `read_with_retry()`: bounded retry of read-only provider calls that
//!   failed with `BackendUnavailable`

use rand::Rng;
use reqwest::{Client, Request, Response};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::ProviderError;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter on top of each delay
    pub jitter: bool,
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based). The cap applies before
    /// jitter is added.
    pub fn delay(&self, attempt: u32) -> Duration {
        let growth = self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = (self.base_delay_ms as f64 * growth).min(self.max_delay_ms as f64);
        let spread = if self.jitter {
            millis * rand::thread_rng().gen_range(0.0..=0.25)
        } else {
            0.0
        };
        Duration::from_millis((millis + spread) as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration for HTTP retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRetryConfig {
    /// Maximum number of retry attempts (default: 3)
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Retry budget for idempotent reads at the orchestrator level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: BackoffConfig {
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                ..BackoffConfig::default()
            },
        }
    }
}

/// Determine if a status code is retryable
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Parse Retry-After header value (seconds form only)
fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs.min(300)))
}

/// Send an idempotent backend request, retrying 429/5xx answers.
///
/// Every attempt sends a clone of `request`. A request whose body cannot be
/// cloned (a streamed upload) goes out exactly once.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    config: &HttpRetryConfig,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0;
    loop {
        let Some(next) = request.try_clone() else {
            return client.execute(request).await;
        };
        let response = client.execute(next).await?;
        let status = response.status();
        if attempt >= config.max_retries || !is_retryable_status(status.as_u16()) {
            return Ok(response);
        }
        let delay = parse_retry_after(&response).unwrap_or_else(|| config.backoff.delay(attempt));
        tracing::warn!(
            "[Retry] {} {} answered {}. Retry {}/{} after {:?}",
            request.method(),
            request.url().path(),
            status,
            attempt + 1,
            config.max_retries,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Run a read-only provider call, retrying `BackendUnavailable` failures.
///
/// Never wrap destructive operations in this.
pub async fn read_with_retry<T, F, Fut>(
    operation: &str,
    config: &ReadRetryConfig,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.backoff.delay(attempt);
                tracing::warn!(
                    "[Retry] {} failed: {}. Retry {}/{} after {:?}",
                    operation,
                    e,
                    attempt + 1,
                    config.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
