// src/purchase/classify.rs
//! Turn one probe response (status + body) into a verdict for the probe loop.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Bought, or already owned by this account.
    Success,
    /// 401/403: credentials are wrong for every endpoint.
    AuthFailure,
    /// Funds, sold out, or rejected: no other endpoint will do better.
    Terminal,
    /// The endpoint wants the security answer in a different field.
    NeedsSecret,
    /// 429 or an explicit "retry" marker: resend the same candidate.
    RetryRequested,
    /// Wrong endpoint or unrecognized failure: move on.
    Transient,
}

impl ProbeVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeVerdict::Success => "success",
            ProbeVerdict::AuthFailure => "auth",
            ProbeVerdict::Terminal => "terminal",
            ProbeVerdict::NeedsSecret => "needs_secret",
            ProbeVerdict::RetryRequested => "retry",
            ProbeVerdict::Transient => "transient",
        }
    }
}

static RE_SUCCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)"success"\s*:\s*true|"status"\s*:\s*"(ok|success)"|\b(successfully|already) purchased\b|already bought|уже куплен"#,
    )
    .expect("success marker regex")
});
static RE_SECRET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)secret|answer|секрет").expect("secret marker regex"));
static RE_TERMINAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)insufficient|not enough|недостаточно|already sold|уже продан|item not found|не найден|cannot be (purchased|bought)|rejected|declined|отклон",
    )
    .expect("terminal marker regex")
});
static RE_RETRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)retry_request|try again|retry later|повторите").expect("retry marker regex")
});

/// Precedence: 2xx, auth, wrong-endpoint statuses, then body markers
/// (success, secret, terminal, retry), else transient.
pub fn classify(status: u16, body: &str) -> ProbeVerdict {
    if (200..300).contains(&status) {
        return ProbeVerdict::Success;
    }
    if status == 401 || status == 403 {
        return ProbeVerdict::AuthFailure;
    }
    // a missing route says nothing about the listing
    if status == 404 || status == 405 {
        return ProbeVerdict::Transient;
    }
    if RE_SUCCESS.is_match(body) {
        return ProbeVerdict::Success;
    }
    if RE_SECRET.is_match(body) {
        return ProbeVerdict::NeedsSecret;
    }
    if RE_TERMINAL.is_match(body) {
        return ProbeVerdict::Terminal;
    }
    if status == 429 || RE_RETRY.is_match(body) {
        return ProbeVerdict::RetryRequested;
    }
    ProbeVerdict::Transient
}
