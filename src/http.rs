// src/http.rs
//! Shared outbound HTTP plumbing: one pooled client and one global
//! concurrency gate for every fetch and purchase request.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::HunterConfig;

#[derive(Clone)]
pub struct HttpContext {
    client: reqwest::Client,
    gate: Arc<Semaphore>,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpContext {
    pub fn new(max_concurrent: usize, timeout: Duration, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("listing-hunter/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
            api_key,
            timeout,
        })
    }

    pub fn from_config(cfg: &HunterConfig) -> Result<Self> {
        Self::new(
            cfg.max_concurrent_requests,
            cfg.fetch_timeout(),
            cfg.api_key.clone(),
        )
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for a slot under the global cap. The gate is never closed, so an
    /// acquire error cannot happen in practice; it is reported as `None`.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.gate.acquire().await.ok()
    }

    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Attach the bearer token when one is configured.
    pub fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}
