// src/store/memory.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{now_unix, Role, Store, StoreState, UserId};
use crate::sources::Source;

/// Process-local store. Used by tests and by runs without a state file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut st = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut st)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn known_users(&self) -> Result<Vec<UserId>> {
        Ok(self.with(|st| st.users.keys().copied().collect()))
    }

    async fn ensure_user(&self, user: UserId) -> Result<()> {
        self.with(|st| st.ensure_user(user));
        Ok(())
    }

    async fn role(&self, user: UserId) -> Result<Role> {
        Ok(self.with(|st| st.role(user)))
    }

    async fn set_role(&self, user: UserId, role: Role) -> Result<()> {
        self.with(|st| st.set_role(user, role));
        Ok(())
    }

    async fn sources(&self, user: UserId) -> Result<Vec<Source>> {
        Ok(self.with(|st| st.sources(user)))
    }

    async fn add_source(&self, user: UserId, url: &str) -> Result<bool> {
        Ok(self.with(|st| st.add_source(user, url)))
    }

    async fn remove_source(&self, user: UserId, url: &str) -> Result<bool> {
        Ok(self.with(|st| st.remove_source(user, url)))
    }

    async fn set_enabled(&self, user: UserId, url: &str, enabled: bool) -> Result<bool> {
        Ok(self.with(|st| {
            st.update_source(user, url, |s| {
                s.enabled = enabled;
                true
            })
        }))
    }

    async fn set_autobuy(&self, user: UserId, url: &str, autobuy: bool) -> Result<bool> {
        Ok(self.with(|st| {
            st.update_source(user, url, |s| {
                s.autobuy = autobuy;
                true
            })
        }))
    }

    async fn is_seen(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.with(|st| st.is_seen(user, key)))
    }

    async fn mark_seen(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.with(|st| st.mark_seen(user, key, now_unix())))
    }

    async fn mark_seen_many(&self, user: UserId, keys: &[String]) -> Result<usize> {
        Ok(self.with(|st| st.mark_seen_many(user, keys, now_unix())))
    }

    async fn load_seen(&self, user: UserId) -> Result<HashSet<String>> {
        Ok(self.with(|st| st.load_seen(user)))
    }

    async fn is_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.with(|st| st.is_purchase_attempted(user, key)))
    }

    async fn mark_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.with(|st| st.mark_purchase_attempted(user, key, now_unix())))
    }

    async fn load_purchase_attempts(&self, user: UserId) -> Result<HashSet<String>> {
        Ok(self.with(|st| st.load_purchase_attempts(user)))
    }

    async fn last_error_report(&self, user: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.with(|st| st.last_error_report(user)))
    }

    async fn set_last_error_report(&self, user: UserId, ts: DateTime<Utc>) -> Result<()> {
        self.with(|st| st.set_last_error_report(user, ts));
        Ok(())
    }
}
