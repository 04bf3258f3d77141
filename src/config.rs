// src/config.rs
//! Runtime configuration: a TOML file for tunables and user bootstrap, the
//! environment for secrets.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filter::FilterSettings;
use crate::store::{Role, UserId};

pub const DEFAULT_CONFIG_PATH: &str = "config/hunter.toml";
pub const ENV_CONFIG_PATH: &str = "HUNTER_CONFIG_PATH";
pub const ENV_API_KEY: &str = "LZT_API_KEY";
pub const ENV_SECRET_WORD: &str = "LZT_SECRET_WORD";
pub const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
pub const ENV_BOT_TOKEN_LEGACY: &str = "API_TOKEN";

fn default_max_concurrent_requests() -> usize {
    6
}
fn default_fetch_timeout_secs() -> u64 {
    12
}
fn default_retry_max() -> u32 {
    4
}
fn default_retry_base_delay_secs() -> f64 {
    1.0
}
fn default_retry_jitter_ratio() -> f64 {
    0.3
}
fn default_interval_base_secs() -> f64 {
    1.0
}
fn default_limited_extra_delay_secs() -> f64 {
    3.0
}
fn default_error_report_interval_secs() -> u64 {
    3600
}
fn default_max_sources_default() -> usize {
    50
}
fn default_max_sources_limited() -> usize {
    3
}
fn default_purchase_retry_limit() -> u32 {
    3
}
fn default_purchase_retry_delay_ms() -> u64 {
    1000
}
fn default_fallback_hosts() -> Vec<String> {
    vec![
        "https://api.lzt.market".to_string(),
        "https://api.lolz.live".to_string(),
    ]
}
fn default_allowed_hosts() -> Vec<String> {
    vec!["api.lzt.market".to_string(), "api.lolz.live".to_string()]
}
fn default_store_path() -> PathBuf {
    PathBuf::from("state/hunter.json")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct HunterConfig {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,
    #[serde(default = "default_retry_jitter_ratio")]
    pub retry_jitter_ratio: f64,
    #[serde(default = "default_interval_base_secs")]
    pub interval_base_secs: f64,
    #[serde(default = "default_limited_extra_delay_secs")]
    pub limited_extra_delay_secs: f64,
    #[serde(default = "default_error_report_interval_secs")]
    pub error_report_interval_secs: u64,
    #[serde(default = "default_max_sources_default")]
    pub max_sources_default: usize,
    #[serde(default = "default_max_sources_limited")]
    pub max_sources_limited: usize,
    #[serde(default = "default_purchase_retry_limit")]
    pub purchase_retry_limit: u32,
    #[serde(default = "default_purchase_retry_delay_ms")]
    pub purchase_retry_delay_ms: u64,
    #[serde(default = "default_fallback_hosts")]
    pub fallback_hosts: Vec<String>,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Prometheus listener, e.g. "0.0.0.0:9000". Disabled when absent.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub users: Vec<UserBootstrap>,

    /// Filled from the environment, never from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(skip)]
    pub secret_answer: Option<String>,
    #[serde(skip)]
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserBootstrap {
    pub id: UserId,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub title_filter: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub sources: Vec<SourceBootstrap>,
    #[serde(default)]
    pub autostart: bool,
}

impl UserBootstrap {
    pub fn filter(&self) -> FilterSettings {
        FilterSettings {
            title_phrase: self.title_filter.clone(),
            min_price: self.min_price,
            max_price: self.max_price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceBootstrap {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub autobuy: bool,
}

impl Default for HunterConfig {
    fn default() -> Self {
        // An empty document picks up every serde default.
        Self::from_toml_str("").unwrap_or_else(|_| unreachable!("empty config always parses"))
    }
}

impl HunterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: HunterConfig = toml::from_str(s).context("parsing hunter config")?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    /// Resolve the config path from `$HUNTER_CONFIG_PATH` (must exist) or the
    /// default location (may be missing, then defaults apply), then overlay
    /// secrets from the environment.
    pub fn load_default() -> Result<Self> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    anyhow::bail!("{ENV_CONFIG_PATH} points to non-existent path");
                }
                Self::load_from_file(&pb)?
            }
            Err(_) => {
                let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
                if pb.exists() {
                    Self::load_from_file(&pb)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        self.api_key = non_empty_env(ENV_API_KEY);
        self.secret_answer = non_empty_env(ENV_SECRET_WORD);
        self.bot_token = non_empty_env(ENV_BOT_TOKEN).or_else(|| non_empty_env(ENV_BOT_TOKEN_LEGACY));
    }

    fn sanitize(&mut self) {
        self.max_concurrent_requests = self.max_concurrent_requests.max(1);
        self.fetch_timeout_secs = self.fetch_timeout_secs.max(1);
        self.retry_max = self.retry_max.max(1);
        if !self.retry_base_delay_secs.is_finite() || self.retry_base_delay_secs < 0.0 {
            self.retry_base_delay_secs = default_retry_base_delay_secs();
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_ratio) {
            self.retry_jitter_ratio = default_retry_jitter_ratio();
        }
        if !self.interval_base_secs.is_finite() || self.interval_base_secs <= 0.0 {
            self.interval_base_secs = default_interval_base_secs();
        }
        if !self.limited_extra_delay_secs.is_finite() || self.limited_extra_delay_secs < 0.0 {
            self.limited_extra_delay_secs = 0.0;
        }
        self.error_report_interval_secs = self.error_report_interval_secs.max(1);
        self.fallback_hosts = self
            .fallback_hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('/').to_string())
            .filter(|h| !h.is_empty())
            .collect();
        self.allowed_hosts = self
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn error_report_interval(&self) -> Duration {
        Duration::from_secs(self.error_report_interval_secs)
    }

    /// Sleep between polling cycles for a user with `role`.
    pub fn poll_interval(&self, role: Role) -> Duration {
        let extra = if role == Role::Limited {
            self.limited_extra_delay_secs
        } else {
            0.0
        };
        Duration::from_secs_f64(self.interval_base_secs + extra)
    }

    pub fn source_limit(&self, role: Role) -> usize {
        match role {
            Role::Limited => self.max_sources_limited,
            _ => self.max_sources_default,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
