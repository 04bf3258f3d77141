// src/sources.rs
//! Listing sources: URL normalization and validation, per-role caps, and the
//! add/remove/toggle operations on top of the store.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::HunterConfig;
use crate::fetch::ListingFetcher;
use crate::store::{Store, UserId};

/// Attempt budget for the probe fetch done before a source is accepted.
const VALIDATION_RETRIES: u32 = 2;
const CANONICAL_HOST: &str = "https://api.lzt.market";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub autobuy: bool,
}

impl Source {
    /// New sources start enabled with autobuy off.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            autobuy: false,
        }
    }
}

/// A source as polled in one cycle, with its 1-based display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSource {
    pub position: usize,
    pub url: String,
    pub autobuy: bool,
}

impl ActiveSource {
    pub fn label(&self) -> String {
        format!("URL #{}", self.position)
    }
}

/// Enabled sources in stored order, first occurrence wins on duplicate URLs.
/// Positions count all distinct sources, so labels match the full list.
pub fn enabled_sources(all: &[Source]) -> Vec<ActiveSource> {
    let mut seen = HashSet::new();
    all.iter()
        .filter(|s| seen.insert(s.url.as_str()))
        .enumerate()
        .filter(|(_, s)| s.enabled)
        .map(|(i, s)| ActiveSource {
            position: i + 1,
            url: s.url.clone(),
            autobuy: s.autobuy,
        })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("not an http(s) URL")]
    NotAUrl,
    #[error("host `{0}` is not an allowed listing API")]
    HostNotAllowed(String),
    #[error("source already added")]
    Duplicate,
    #[error("source limit reached ({0})")]
    LimitReached(usize),
    #[error("source check failed: {0}")]
    ProbeFailed(String),
    #[error("no such source")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for SourceError {
    fn from(e: anyhow::Error) -> Self {
        SourceError::Storage(format!("{e:#}"))
    }
}

static RE_API_MARKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://api.*?\.market").expect("api market regex"));
static RE_LOLZ_GURU: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://api\.lolz\.guru").expect("lolz guru regex"));

/// Query-key misspellings seen in pasted links, applied in order.
const KEY_FIXES: &[(&str, &str)] = &[
    ("genshinlevelmin", "genshin_level_min"),
    ("genshinlevel_min", "genshin_level_min"),
    ("genshin_levelmin", "genshin_level_min"),
    ("brawl_cupmin", "brawl_cup_min"),
    ("clash_cupmin", "clash_cup_min"),
    ("clashcupmin", "clash_cup_min"),
    ("clashcupmax", "clash_cup_max"),
    ("clash_cupmax", "clash_cup_max"),
    ("orderby", "order_by"),
    ("order_by=pdate_to_down_upoad", "order_by=pdate_to_down_upload"),
    ("order_by=pdate_to_down_up", "order_by=pdate_to_down_upload"),
    ("order_by=pdate_to_downupload", "order_by=pdate_to_down_upload"),
];

/// Canonicalize a pasted source link: drop whitespace, fold mirror hosts onto
/// the canonical API host, repair known query-key typos.
pub fn normalize_url(raw: &str) -> String {
    let mut s: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return s;
    }

    s = RE_API_MARKET.replace(&s, CANONICAL_HOST).into_owned();
    s = RE_LOLZ_GURU.replace(&s, CANONICAL_HOST).into_owned();
    s = s.replace("://lzt.market", "://api.lzt.market");
    s = s.replace("://www.lzt.market", "://api.lzt.market");

    for (from, to) in KEY_FIXES {
        // "order_by=pdate_to_down_up" is a prefix of the fixed value itself
        if s.contains(to) {
            continue;
        }
        s = s.replace(from, to);
    }

    if s.contains(".market") && !s.starts_with(CANONICAL_HOST) {
        if let Some(tail) = s.rsplit(".market").next() {
            s = format!("{CANONICAL_HOST}{tail}");
        }
    }
    s
}

/// Must be http(s) and point at one of `allowed_hosts`.
pub fn validate_url(url: &str, allowed_hosts: &[String]) -> Result<(), SourceError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| SourceError::NotAUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SourceError::NotAUrl);
    }
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if allowed_hosts.is_empty() || allowed_hosts.iter().any(|h| *h == host) {
        Ok(())
    } else {
        Err(SourceError::HostNotAllowed(host))
    }
}

/// Source operations for one process; all users share it.
#[derive(Clone)]
pub struct SourceManager {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn ListingFetcher>,
    cfg: Arc<HunterConfig>,
}

impl SourceManager {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn ListingFetcher>,
        cfg: Arc<HunterConfig>,
    ) -> Self {
        Self {
            store,
            fetcher,
            cfg,
        }
    }

    /// Normalize, validate, check duplicates and the role cap, probe the URL
    /// once (an empty list is fine), then persist. Returns the stored URL.
    pub async fn add(&self, user: UserId, raw_url: &str) -> Result<String, SourceError> {
        let url = normalize_url(raw_url);
        validate_url(&url, &self.cfg.allowed_hosts)?;

        self.store.ensure_user(user).await?;
        let existing = self.store.sources(user).await?;
        if existing.iter().any(|s| s.url == url) {
            return Err(SourceError::Duplicate);
        }
        let role = self.store.role(user).await?;
        let limit = self.cfg.source_limit(role);
        if existing.len() >= limit {
            return Err(SourceError::LimitReached(limit));
        }

        let probe = self
            .fetcher
            .fetch_with_retries(&url, VALIDATION_RETRIES)
            .await;
        if let Some(e) = probe.error {
            return Err(SourceError::ProbeFailed(e.cause));
        }

        if !self.store.add_source(user, &url).await? {
            return Err(SourceError::Duplicate);
        }
        tracing::info!(target: "sources", user, %url, "source added");
        Ok(url)
    }

    pub async fn remove(&self, user: UserId, url: &str) -> Result<(), SourceError> {
        if self.store.remove_source(user, url).await? {
            tracing::info!(target: "sources", user, %url, "source removed");
            Ok(())
        } else {
            Err(SourceError::NotFound)
        }
    }

    pub async fn set_enabled(&self, user: UserId, url: &str, enabled: bool) -> Result<(), SourceError> {
        found(self.store.set_enabled(user, url, enabled).await?)
    }

    pub async fn set_autobuy(&self, user: UserId, url: &str, autobuy: bool) -> Result<(), SourceError> {
        found(self.store.set_autobuy(user, url, autobuy).await?)
    }

    pub async fn list(&self, user: UserId) -> Result<Vec<Source>, SourceError> {
        Ok(self.store.sources(user).await?)
    }
}

fn found(ok: bool) -> Result<(), SourceError> {
    if ok {
        Ok(())
    } else {
        Err(SourceError::NotFound)
    }
}
