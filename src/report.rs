// src/report.rs
//! Error aggregator: per-user failure counters and the periodic,
//! rate-limited summary that replaces one message per failure.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::notify::antiflutter::AntiFlutter;
use crate::notify::{deliver_best_effort, Notification, Notifier};
use crate::store::{Store, UserId};

#[derive(Debug, Default)]
pub struct ErrorAggregator {
    counts: Mutex<HashMap<UserId, u64>>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<UserId, u64>> {
        match self.counts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, user: UserId, n: u64) {
        if n == 0 {
            return;
        }
        let mut m = self.counts();
        *m.entry(user).or_insert(0) += n;
    }

    pub fn count(&self, user: UserId) -> u64 {
        let m = self.counts();
        m.get(&user).copied().unwrap_or(0)
    }

    /// Users with a non-zero count right now.
    pub fn pending_users(&self) -> Vec<UserId> {
        let m = self.counts();
        let mut users: Vec<_> = m.iter().filter(|(_, c)| **c > 0).map(|(u, _)| *u).collect();
        users.sort_unstable();
        users
    }

    /// Subtract what was just reported; failures recorded meanwhile stay.
    fn settle(&self, user: UserId, reported: u64) {
        let mut m = self.counts();
        if let Some(c) = m.get_mut(&user) {
            *c = c.saturating_sub(reported);
        }
    }
}

/// Periodic summary sender.
pub struct ErrorReporter {
    aggregator: Arc<ErrorAggregator>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    gate: AntiFlutter,
}

impl ErrorReporter {
    pub fn new(
        aggregator: Arc<ErrorAggregator>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        let secs = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        Self {
            aggregator,
            store,
            notifier,
            interval,
            gate: AntiFlutter::new(secs),
        }
    }

    /// One pass: summarize every user with pending failures whose last
    /// report is older than the interval. Returns the users reported to.
    pub async fn report_once(&self) -> Vec<UserId> {
        let now = Utc::now();
        let mut reported = Vec::new();
        for user in self.aggregator.pending_users() {
            let count = self.aggregator.count(user);
            let last = match self.store.last_error_report(user).await {
                Ok(last) => last,
                Err(e) => {
                    tracing::warn!(target: "report", user, error = %format!("{e:#}"), "reading last report time failed");
                    continue;
                }
            };
            if !self.gate.should_alert(last, now) {
                tracing::debug!(target: "report", user, count, "summary suppressed by cooldown");
                continue;
            }

            let msg = Notification::ErrorSummary {
                count,
                window_secs: self.interval.as_secs(),
            };
            deliver_best_effort(self.notifier.as_ref(), user, &msg).await;
            self.aggregator.settle(user, count);
            if let Err(e) = self.store.set_last_error_report(user, now).await {
                tracing::warn!(target: "report", user, error = %format!("{e:#}"), "persisting report time failed");
            }
            tracing::info!(target: "report", user, count, "error summary sent");
            reported.push(user);
        }
        reported
    }

    /// Run `report_once` every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                self.report_once().await;
            }
            tracing::debug!(target: "report", "error reporter stopped");
        })
    }
}
