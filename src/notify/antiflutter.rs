// src/notify/antiflutter.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Cooldown gate against notification spam.
/// - First report always allowed.
/// - Inside cooldown, reports are suppressed.
/// - The caller persists the time of the last successful report and feeds it
///   back in, so the gate itself is stateless across restarts.
#[derive(Debug, Clone, Copy)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
        }
    }

    pub fn should_alert(&self, last_alert: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_alert {
            None => true,
            Some(ts) => now.signed_duration_since(ts) >= self.cooldown,
        }
    }
}
