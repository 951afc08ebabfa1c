//! Rate-limited HTTP transport + relational persistence for harvested channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

mod gateway;

pub use gateway::{
    comment_key, ChannelCounts, HarvestStore, MemoryHarvestStore, PgHarvestStore, StoredComment,
};

pub const CRATE_NAME: &str = "yth-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `reason` codes the content API uses for per-user or per-second throttling.
/// These arrive as 403, unlike `quotaExceeded`, which lasts until the daily reset.
pub const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

pub fn classify_response(status: StatusCode, reasons: &[String]) -> RetryDisposition {
    if classify_status(status) == RetryDisposition::Retryable {
        return RetryDisposition::Retryable;
    }
    if status == StatusCode::FORBIDDEN
        && reasons
            .iter()
            .any(|r| RATE_LIMIT_REASONS.contains(&r.as_str()))
    {
        return RetryDisposition::Retryable;
    }
    RetryDisposition::NonRetryable
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorItem {
    reason: Option<String>,
}

/// `reason` codes from a Google-style error body; empty when the body is not one.
pub fn api_error_reasons(body: &[u8]) -> Vec<String> {
    let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) else {
        return Vec::new();
    };
    parsed
        .error
        .map(|e| e.errors)
        .unwrap_or_default()
        .into_iter()
        .chain(parsed.errors)
        .filter_map(|e| e.reason)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applied to every individual request; a timed-out attempt uses up one retry.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that sustains roughly `rps` requests per second with a burst of `rps`.
    pub fn per_second(rps: u32) -> Self {
        let rps = rps.max(1);
        Self {
            capacity: rps,
            refill_every: Duration::from_millis(1000 / u64::from(rps)).max(Duration::from_millis(1)),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub endpoint: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed after {attempts} attempt(s): {source}")]
    Request {
        endpoint: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error(
        "http status {status}{} for {endpoint} after {attempts} attempt(s)",
        .reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
    )]
    HttpStatus {
        status: u16,
        endpoint: String,
        attempts: usize,
        reason: Option<String>,
    },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } | FetchError::HttpStatus { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request { source, .. } => source.status().map(|s| s.as_u16()),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query`, retrying transient failures with exponential backoff.
    ///
    /// Only `url` is recorded in logs and errors; credentials belong in `query`.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_fetch", endpoint = url);
        self.get_with_retries(url, query).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;

        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = match resp.bytes().await {
                        Ok(body) => body.to_vec(),
                        Err(err) if status.is_success() => {
                            return Err(FetchError::Request {
                                endpoint: url.to_string(),
                                attempts,
                                source: err.without_url(),
                            });
                        }
                        Err(_) => Vec::new(),
                    };

                    if status.is_success() {
                        return Ok(FetchedResponse {
                            status,
                            endpoint: url.to_string(),
                            body,
                            attempts,
                        });
                    }

                    let reasons = api_error_reasons(&body);
                    if classify_response(status, &reasons) == RetryDisposition::Retryable
                        && can_retry
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            status = status.as_u16(),
                            reasons = ?reasons,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after transient http status"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint: url.to_string(),
                        attempts,
                        reason: reasons.into_iter().next(),
                    });
                }
                Err(err) => {
                    // reqwest errors embed the full request url, query string included
                    let err = err.without_url();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            error = %err,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after transport error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        endpoint: url.to_string(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }
}
