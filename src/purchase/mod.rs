// src/purchase/mod.rs
//! Purchase executor: the marketplace has no single documented buy endpoint,
//! so a purchase walks an ordered candidate list and stops at the first
//! decisive answer. Every probe goes through the shared HTTP gate.

pub mod candidates;
pub mod classify;

use metrics::counter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use candidates::{build_candidates, Candidate, Encoding};
pub use classify::{classify, ProbeVerdict};

use crate::config::HunterConfig;
use crate::fetch::excerpt;
use crate::http::HttpContext;
use crate::listing::Listing;
use crate::telemetry;

const DETAIL_EXCERPT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Succeeded,
    /// Credentials rejected; probing stopped.
    AuthRejected,
    /// Funds, sold, or rejected; probing stopped.
    Terminal,
    /// Every candidate tried without a decisive answer.
    Exhausted,
    /// No usable integer item id; nothing was sent.
    InvalidListing,
    /// The session was stopped before a decisive answer.
    Cancelled,
}

impl PurchaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseOutcome::Succeeded => "succeeded",
            PurchaseOutcome::AuthRejected => "auth_rejected",
            PurchaseOutcome::Terminal => "terminal",
            PurchaseOutcome::Exhausted => "exhausted",
            PurchaseOutcome::InvalidListing => "invalid_listing",
            PurchaseOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReport {
    pub outcome: PurchaseOutcome,
    pub detail: String,
    /// Requests actually sent.
    pub probes: usize,
}

impl PurchaseReport {
    pub fn success(&self) -> bool {
        self.outcome == PurchaseOutcome::Succeeded
    }

    fn finish(outcome: PurchaseOutcome, detail: impl Into<String>, probes: usize) -> Self {
        counter!("hunter_purchase_outcomes_total", "outcome" => outcome.as_str()).increment(1);
        Self {
            outcome,
            detail: detail.into(),
            probes,
        }
    }
}

#[async_trait::async_trait]
pub trait Purchaser: Send + Sync {
    /// Attempt to buy `listing` found under `source_url`. Never fails; the
    /// report carries the outcome. Once `cancel` fires no further request
    /// is started.
    async fn purchase(
        &self,
        source_url: &str,
        listing: &Listing,
        cancel: &CancellationToken,
    ) -> PurchaseReport;
}

#[derive(Clone)]
pub struct PurchaseExecutor {
    http: HttpContext,
    fallback_hosts: Vec<String>,
    secret: Option<String>,
    retry_limit: u32,
    retry_delay: Duration,
}

impl PurchaseExecutor {
    pub fn new(http: HttpContext, fallback_hosts: Vec<String>, secret: Option<String>) -> Self {
        telemetry::ensure_metrics_described();
        Self {
            http,
            fallback_hosts,
            secret,
            retry_limit: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(http: HttpContext, cfg: &HunterConfig) -> Self {
        Self::new(http, cfg.fallback_hosts.clone(), cfg.secret_answer.clone())
            .with_retry(cfg.purchase_retry_limit, Duration::from_millis(cfg.purchase_retry_delay_ms))
    }

    pub fn with_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_delay = delay;
        self
    }

    /// Candidate list for a listing, or `None` when the item id is missing
    /// or not an integer.
    pub fn candidates_for(&self, source_url: &str, listing: &Listing) -> Option<Vec<Candidate>> {
        let item_id: i64 = listing.item_id()?.parse().ok()?;
        Some(build_candidates(
            item_id,
            listing,
            source_url,
            &self.fallback_hosts,
            self.secret.as_deref(),
        ))
    }

    async fn send(&self, c: &Candidate) -> Result<(u16, String), String> {
        let _permit = self.http.acquire().await;
        counter!("hunter_purchase_probes_total").increment(1);

        let req = self
            .http
            .authorize(self.http.client().post(&c.url))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.http.timeout());
        let req = match c.encoding {
            Encoding::Json => req.json(&c.payload),
            Encoding::Form => req.form(&c.form_pairs()),
        };
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                "request timed out".to_string()
            } else {
                format!("network error: {e}")
            }
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Walk `candidates` in order until one gives a decisive verdict.
    pub async fn probe(&self, candidates: &[Candidate]) -> PurchaseReport {
        self.walk(candidates, &CancellationToken::new()).await
    }

    /// [`probe`](Self::probe) that stops between requests once `cancel` fires.
    pub async fn walk(&self, candidates: &[Candidate], cancel: &CancellationToken) -> PurchaseReport {
        let mut probes = 0usize;
        let mut last_err = String::from("no purchase endpoints to try");

        for c in candidates {
            let mut retries = 0u32;
            loop {
                if cancel.is_cancelled() {
                    let detail = format!("stopped after {probes} requests; last: {last_err}");
                    return PurchaseReport::finish(PurchaseOutcome::Cancelled, detail, probes);
                }
                probes += 1;
                let (status, body) = match self.send(c).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(target: "purchase", url = %c.describe(), error = %e, "probe failed");
                        last_err = format!("{}: {e}", c.describe());
                        break;
                    }
                };
                let verdict = classify(status, &body);
                let detail = format!(
                    "{} -> HTTP {status}: {}",
                    c.describe(),
                    excerpt(&body, DETAIL_EXCERPT)
                );
                tracing::debug!(
                    target: "purchase",
                    url = %c.describe(),
                    status,
                    verdict = verdict.as_str(),
                    "probe answered"
                );

                match verdict {
                    ProbeVerdict::Success => {
                        return PurchaseReport::finish(PurchaseOutcome::Succeeded, detail, probes)
                    }
                    ProbeVerdict::AuthFailure => {
                        return PurchaseReport::finish(PurchaseOutcome::AuthRejected, detail, probes)
                    }
                    ProbeVerdict::Terminal => {
                        return PurchaseReport::finish(PurchaseOutcome::Terminal, detail, probes)
                    }
                    ProbeVerdict::RetryRequested if retries < self.retry_limit => {
                        retries += 1;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => last_err = detail,
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                    ProbeVerdict::RetryRequested
                    | ProbeVerdict::NeedsSecret
                    | ProbeVerdict::Transient => {
                        last_err = detail;
                        break;
                    }
                }
            }
        }
        PurchaseReport::finish(PurchaseOutcome::Exhausted, last_err, probes)
    }
}

#[async_trait::async_trait]
impl Purchaser for PurchaseExecutor {
    async fn purchase(
        &self,
        source_url: &str,
        listing: &Listing,
        cancel: &CancellationToken,
    ) -> PurchaseReport {
        let Some(candidates) = self.candidates_for(source_url, listing) else {
            let id = listing.item_id().unwrap_or_default();
            let detail = if id.is_empty() {
                "listing has no item id".to_string()
            } else {
                format!("item id is not an integer: {id}")
            };
            tracing::warn!(target: "purchase", %detail, "purchase skipped");
            return PurchaseReport::finish(PurchaseOutcome::InvalidListing, detail, 0);
        };

        let report = self.walk(&candidates, cancel).await;
        tracing::info!(
            target: "purchase",
            item_id = %listing.item_id().unwrap_or_default(),
            outcome = report.outcome.as_str(),
            probes = report.probes,
            "purchase finished"
        );
        report
    }
}
