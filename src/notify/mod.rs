// src/notify/mod.rs
//! Outbound user notifications. Delivery is best-effort: failures are logged
//! by the mux and never reach the polling loop.

pub mod antiflutter;
pub mod card;
pub mod telegram;

use anyhow::Result;
use metrics::counter;
use std::sync::Arc;

use crate::store::UserId;

pub use card::make_card;
pub use telegram::TelegramNotifier;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A new listing that passed the user's filter.
    Listing {
        card: String,
        /// Marketplace page for the listing, when it has an id.
        link: Option<String>,
    },
    /// Outcome of one autobuy attempt.
    Purchase {
        source_label: String,
        item_id: Option<String>,
        success: bool,
        detail: String,
    },
    /// Rate-limited failure summary.
    ErrorSummary { count: u64, window_secs: u64 },
}

impl Notification {
    /// HTML body (Telegram `parse_mode=HTML`).
    pub fn html(&self) -> String {
        match self {
            Notification::Listing { card, .. } => card.clone(),
            Notification::Purchase {
                source_label,
                item_id,
                success,
                detail,
            } => {
                let id = html_escape::encode_text(item_id.as_deref().unwrap_or("—")).into_owned();
                let label = html_escape::encode_text(source_label).into_owned();
                if *success {
                    format!("🛒 Autobuy succeeded: {label} | item_id={id}")
                } else {
                    format!(
                        "⚠️ Autobuy failed: {label} | item_id={id} | {}",
                        html_escape::encode_text(detail)
                    )
                }
            }
            Notification::ErrorSummary { count, window_secs } => format!(
                "⚠️ In the last {} the listing API failed or returned no item list <b>{count}</b> time(s).",
                human_window(*window_secs)
            ),
        }
    }

    /// Fallback text when HTML is rejected.
    pub fn plain(&self) -> String {
        match self {
            Notification::Listing { card, .. } => strip_tags(card),
            other => strip_tags(&other.html()),
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            Notification::Listing { link, .. } => link.as_deref(),
            _ => None,
        }
    }
}

fn human_window(secs: u64) -> String {
    match secs {
        3600 => "hour".to_string(),
        s if s % 3600 == 0 => format!("{} hours", s / 3600),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{s} seconds"),
    }
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    html_escape::decode_html_entities(&out).into_owned()
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, user: UserId, msg: &Notification) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Tracing-only channel, used when no transport is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, user: UserId, msg: &Notification) -> Result<()> {
        tracing::info!(target: "notify", user, text = %msg.plain(), "notification");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Fans a notification out to every channel; one failing channel neither
/// blocks the others nor propagates.
#[derive(Clone, Default)]
pub struct NotifierMux {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    /// Telegram when a bot token is configured, tracing otherwise.
    pub fn from_token(bot_token: Option<&str>) -> Self {
        match bot_token {
            Some(token) => Self::new(vec![Arc::new(TelegramNotifier::new(token))]),
            None => {
                tracing::warn!(target: "notify", "no bot token configured; notifications go to the log");
                Self::new(vec![Arc::new(LogNotifier)])
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait::async_trait]
impl Notifier for NotifierMux {
    async fn deliver(&self, user: UserId, msg: &Notification) -> Result<()> {
        for ch in &self.channels {
            if let Err(e) = ch.deliver(user, msg).await {
                tracing::warn!(
                    target: "notify",
                    user,
                    channel = ch.name(),
                    error = %format!("{e:#}"),
                    "notification delivery failed"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}

/// Deliver and swallow any error; used wherever a notification must not
/// disturb the caller's control flow.
pub async fn deliver_best_effort(notifier: &dyn Notifier, user: UserId, msg: &Notification) {
    if matches!(msg, Notification::Listing { .. }) {
        counter!("hunter_notifications_total").increment(1);
    }
    if let Err(e) = notifier.deliver(user, msg).await {
        tracing::warn!(
            target: "notify",
            user,
            channel = notifier.name(),
            error = %format!("{e:#}"),
            "notification delivery failed"
        );
    }
}
