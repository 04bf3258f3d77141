// src/fetch.rs
//! Listing fetch client: GET a source URL through the global gate, parse the
//! `items` list, retry with exponential backoff plus jitter. Never panics and
//! never returns `Err`; failures travel inside `FetchOutcome`.

use metrics::counter;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HunterConfig;
use crate::http::HttpContext;
use crate::listing::Listing;
use crate::telemetry;

/// Longest body excerpt carried in an error message.
const BODY_EXCERPT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transport,
    Timeout,
    /// Body was not JSON.
    Body,
    /// JSON without a list under `items`.
    Shape,
}

/// All fetch failures share one error type; `kind` is diagnostic only and
/// callers treat every kind the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub cause: String,
}

impl FetchError {
    fn new(kind: FetchErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<Listing>,
    pub error: Option<FetchError>,
}

impl FetchOutcome {
    pub fn ok(items: Vec<Listing>) -> Self {
        Self { items, error: None }
    }

    pub fn failed(error: FetchError) -> Self {
        Self {
            items: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait::async_trait]
pub trait ListingFetcher: Send + Sync {
    /// Fetch with the configured retry budget.
    async fn fetch(&self, url: &str) -> FetchOutcome;

    /// Fetch with an explicit attempt budget (source validation uses a
    /// smaller one).
    async fn fetch_with_retries(&self, url: &str, _max_retries: u32) -> FetchOutcome {
        self.fetch(url).await
    }

    /// Like `fetch`, but gives up at the next backoff once `cancel` fires.
    /// A request already on the wire still completes.
    async fn fetch_until_cancelled(&self, url: &str, _cancel: &CancellationToken) -> FetchOutcome {
        self.fetch(url).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter, as a share of the pre-jitter delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            jitter_ratio: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &HunterConfig) -> Self {
        Self {
            max_retries: cfg.retry_max,
            base_delay: Duration::from_secs_f64(cfg.retry_base_delay_secs),
            jitter_ratio: cfg.retry_jitter_ratio,
        }
    }

    /// Pre-jitter delay after the `failures`-th consecutive failure:
    /// `base_delay * 2^(failures-1)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Backoff plus a uniform draw from `[0, jitter_ratio * backoff]`.
    pub fn delay_with_jitter<R: Rng>(&self, failures: u32, rng: &mut R) -> Duration {
        let base = self.backoff(failures);
        let max_jitter = base.as_secs_f64() * self.jitter_ratio.clamp(0.0, 1.0);
        let jitter = if max_jitter > 0.0 {
            rng.random_range(0.0..=max_jitter)
        } else {
            0.0
        };
        base + Duration::from_secs_f64(jitter)
    }
}

/// HTTP implementation of [`ListingFetcher`].
#[derive(Clone)]
pub struct FetchClient {
    http: HttpContext,
    policy: RetryPolicy,
}

impl FetchClient {
    pub fn new(http: HttpContext, policy: RetryPolicy) -> Self {
        telemetry::ensure_metrics_described();
        Self { http, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<Listing>, FetchError> {
        let _permit = self.http.acquire().await;
        counter!("hunter_fetch_attempts_total").increment(1);

        let req = self
            .http
            .authorize(self.http.client().get(url))
            .timeout(self.http.timeout());
        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(classify_transport)?;
        parse_items(&text).map_err(|mut e| {
            if !status.is_success() {
                e.cause = format!("HTTP {status}: {}", e.cause);
            }
            e
        })
    }

    fn next_delay(&self, failures: u32) -> Duration {
        self.policy.delay_with_jitter(failures, &mut rand::rng())
    }

    async fn run(
        &self,
        url: &str,
        max_retries: u32,
        cancel: Option<&CancellationToken>,
    ) -> FetchOutcome {
        let max_retries = max_retries.max(1);
        let mut failures = 0u32;
        loop {
            match self.fetch_once(url).await {
                Ok(items) => return FetchOutcome::ok(items),
                Err(e) => {
                    failures += 1;
                    counter!("hunter_fetch_errors_total").increment(1);
                    if failures >= max_retries {
                        tracing::debug!(
                            target: "fetch",
                            %url,
                            attempts = failures,
                            error = %e,
                            "fetch gave up"
                        );
                        return FetchOutcome::failed(e);
                    }
                    let delay = self.next_delay(failures);
                    tracing::debug!(
                        target: "fetch",
                        %url,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "fetch failed, backing off"
                    );
                    if let Some(cancel) = cancel {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                tracing::debug!(target: "fetch", %url, "backoff cut short by cancellation");
                                return FetchOutcome::failed(e);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ListingFetcher for FetchClient {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        self.run(url, self.policy.max_retries, None).await
    }

    async fn fetch_with_retries(&self, url: &str, max_retries: u32) -> FetchOutcome {
        self.run(url, max_retries, None).await
    }

    async fn fetch_until_cancelled(&self, url: &str, cancel: &CancellationToken) -> FetchOutcome {
        self.run(url, self.policy.max_retries, Some(cancel)).await
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::new(FetchErrorKind::Timeout, "request timed out")
    } else {
        FetchError::new(FetchErrorKind::Transport, format!("network error: {e}"))
    }
}

/// Extract the `items` list from a response body.
pub fn parse_items(body: &str) -> Result<Vec<Listing>, FetchError> {
    let data: Value = serde_json::from_str(body).map_err(|_| {
        FetchError::new(
            FetchErrorKind::Body,
            format!("response is not JSON: {}", excerpt(body, BODY_EXCERPT)),
        )
    })?;
    let Some(Value::Array(items)) = data.get("items") else {
        return Err(FetchError::new(
            FetchErrorKind::Shape,
            "response has no `items` list",
        ));
    };
    Ok(items.iter().cloned().filter_map(Listing::from_value).collect())
}

pub(crate) fn excerpt(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
