// src/store/mod.rs
//! Persistence collaborator: per-user sources, role, seen keys and
//! purchase-attempt keys behind one async trait.
//!
//! Every insert is idempotent (`INSERT OR IGNORE` semantics); the first
//! timestamp written for a key is never replaced.

pub mod json_file;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::sources::Source;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Unknown,
    Full,
    Limited,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn known_users(&self) -> Result<Vec<UserId>>;
    async fn ensure_user(&self, user: UserId) -> Result<()>;
    async fn role(&self, user: UserId) -> Result<Role>;
    async fn set_role(&self, user: UserId, role: Role) -> Result<()>;

    /// Sources in insertion order.
    async fn sources(&self, user: UserId) -> Result<Vec<Source>>;
    /// Returns `false` when the URL was already present.
    async fn add_source(&self, user: UserId, url: &str) -> Result<bool>;
    async fn remove_source(&self, user: UserId, url: &str) -> Result<bool>;
    async fn set_enabled(&self, user: UserId, url: &str, enabled: bool) -> Result<bool>;
    async fn set_autobuy(&self, user: UserId, url: &str, autobuy: bool) -> Result<bool>;

    async fn is_seen(&self, user: UserId, key: &str) -> Result<bool>;
    /// Returns `true` only for the first write of `key`.
    async fn mark_seen(&self, user: UserId, key: &str) -> Result<bool>;
    /// Batch form of `mark_seen`, written in one go where the backend can.
    /// Returns how many keys were new.
    async fn mark_seen_many(&self, user: UserId, keys: &[String]) -> Result<usize> {
        let mut fresh = 0;
        for key in keys {
            if self.mark_seen(user, key).await? {
                fresh += 1;
            }
        }
        Ok(fresh)
    }
    async fn load_seen(&self, user: UserId) -> Result<HashSet<String>>;

    async fn is_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool>;
    /// Returns `true` only for the first write of `key`.
    async fn mark_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool>;
    async fn load_purchase_attempts(&self, user: UserId) -> Result<HashSet<String>>;

    async fn last_error_report(&self, user: UserId) -> Result<Option<DateTime<Utc>>>;
    async fn set_last_error_report(&self, user: UserId, ts: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct UserRecord {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// key -> unix seconds of first sighting
    #[serde(default)]
    pub seen: BTreeMap<String, i64>,
    #[serde(default)]
    pub purchase_attempts: BTreeMap<String, i64>,
    #[serde(default)]
    pub last_error_report: Option<DateTime<Utc>>,
}

/// Plain state shared by the memory and file stores. Mutators report whether
/// anything changed so the file store only persists real writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub users: BTreeMap<UserId, UserRecord>,
}

impl StoreState {
    fn user_mut(&mut self, user: UserId) -> &mut UserRecord {
        self.users.entry(user).or_default()
    }

    pub fn ensure_user(&mut self, user: UserId) -> bool {
        if self.users.contains_key(&user) {
            return false;
        }
        self.users.insert(user, UserRecord::default());
        true
    }

    pub fn role(&self, user: UserId) -> Role {
        self.users.get(&user).map(|u| u.role).unwrap_or_default()
    }

    pub fn set_role(&mut self, user: UserId, role: Role) -> bool {
        let rec = self.user_mut(user);
        let changed = rec.role != role;
        rec.role = role;
        changed
    }

    pub fn sources(&self, user: UserId) -> Vec<Source> {
        self.users
            .get(&user)
            .map(|u| u.sources.clone())
            .unwrap_or_default()
    }

    pub fn add_source(&mut self, user: UserId, url: &str) -> bool {
        let rec = self.user_mut(user);
        if rec.sources.iter().any(|s| s.url == url) {
            return false;
        }
        rec.sources.push(Source::new(url));
        true
    }

    pub fn remove_source(&mut self, user: UserId, url: &str) -> bool {
        let Some(rec) = self.users.get_mut(&user) else {
            return false;
        };
        let before = rec.sources.len();
        rec.sources.retain(|s| s.url != url);
        rec.sources.len() != before
    }

    pub fn update_source(
        &mut self,
        user: UserId,
        url: &str,
        apply: impl FnOnce(&mut Source) -> bool,
    ) -> bool {
        self.users
            .get_mut(&user)
            .and_then(|rec| rec.sources.iter_mut().find(|s| s.url == url))
            .map(apply)
            .unwrap_or(false)
    }

    pub fn is_seen(&self, user: UserId, key: &str) -> bool {
        self.users
            .get(&user)
            .is_some_and(|u| u.seen.contains_key(key))
    }

    pub fn mark_seen(&mut self, user: UserId, key: &str, now: i64) -> bool {
        insert_once(&mut self.user_mut(user).seen, key, now)
    }

    pub fn mark_seen_many(&mut self, user: UserId, keys: &[String], now: i64) -> usize {
        let seen = &mut self.user_mut(user).seen;
        keys.iter().filter(|k| insert_once(seen, k, now)).count()
    }

    pub fn load_seen(&self, user: UserId) -> HashSet<String> {
        self.users
            .get(&user)
            .map(|u| u.seen.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_purchase_attempted(&self, user: UserId, key: &str) -> bool {
        self.users
            .get(&user)
            .is_some_and(|u| u.purchase_attempts.contains_key(key))
    }

    pub fn mark_purchase_attempted(&mut self, user: UserId, key: &str, now: i64) -> bool {
        insert_once(&mut self.user_mut(user).purchase_attempts, key, now)
    }

    pub fn load_purchase_attempts(&self, user: UserId) -> HashSet<String> {
        self.users
            .get(&user)
            .map(|u| u.purchase_attempts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_error_report(&self, user: UserId) -> Option<DateTime<Utc>> {
        self.users.get(&user).and_then(|u| u.last_error_report)
    }

    pub fn set_last_error_report(&mut self, user: UserId, ts: DateTime<Utc>) -> bool {
        self.user_mut(user).last_error_report = Some(ts);
        true
    }
}

fn insert_once(map: &mut BTreeMap<String, i64>, key: &str, now: i64) -> bool {
    if map.contains_key(key) {
        return false;
    }
    map.insert(key.to_string(), now);
    true
}

pub(crate) fn now_unix() -> i64 {
    Utc::now().timestamp()
}
