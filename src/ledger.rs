// src/ledger.rs
//! Dedup ledger for one user: the persisted seen/purchase-attempted sets plus
//! an in-memory mirror loaded at session start.
//!
//! A ledger is owned by exactly one polling session, so all writes for a
//! user are sequential. The mirror is updated before the store; a failed
//! store write therefore still suppresses repeats for the rest of the
//! session and surfaces as an error to the caller.
//!
//! The ledger also tracks which sources this session has primed. Primed
//! state is not persisted: every session primes its sources afresh.

use anyhow::{Context, Result};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;

use crate::listing::ListingKey;
use crate::store::{Store, UserId};

pub struct UserLedger {
    user: UserId,
    store: Arc<dyn Store>,
    seen: HashSet<String>,
    attempted: HashSet<String>,
    primed: HashSet<String>,
}

impl UserLedger {
    /// Bulk-load both sets for `user`.
    pub async fn load(store: Arc<dyn Store>, user: UserId) -> Result<Self> {
        let seen = store
            .load_seen(user)
            .await
            .with_context(|| format!("loading seen keys for user {user}"))?;
        let attempted = store
            .load_purchase_attempts(user)
            .await
            .with_context(|| format!("loading purchase attempts for user {user}"))?;
        tracing::debug!(
            target: "ledger",
            user,
            seen = seen.len(),
            attempted = attempted.len(),
            "ledger loaded"
        );
        Ok(Self {
            user,
            store,
            seen,
            attempted,
            primed: HashSet::new(),
        })
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn is_seen(&self, key: &ListingKey) -> bool {
        self.seen.contains(key.as_str())
    }

    /// Idempotent. Returns `true` if the key was new.
    pub async fn mark_seen(&mut self, key: &ListingKey) -> Result<bool> {
        if !self.seen.insert(key.as_str().to_string()) {
            return Ok(false);
        }
        counter!("hunter_listings_seen_total").increment(1);
        self.store
            .mark_seen(self.user, key.as_str())
            .await
            .with_context(|| format!("persisting seen key {key}"))?;
        Ok(true)
    }

    /// Mark every key seen with a single store write. Returns how many were
    /// new.
    pub async fn mark_seen_batch(&mut self, keys: &[ListingKey]) -> Result<usize> {
        let fresh: Vec<String> = keys
            .iter()
            .filter(|k| self.seen.insert(k.as_str().to_string()))
            .map(|k| k.as_str().to_string())
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        counter!("hunter_listings_seen_total").increment(fresh.len() as u64);
        self.store
            .mark_seen_many(self.user, &fresh)
            .await
            .with_context(|| format!("persisting {} seen keys", fresh.len()))?;
        Ok(fresh.len())
    }

    pub fn is_primed(&self, source_url: &str) -> bool {
        self.primed.contains(source_url)
    }

    pub fn mark_primed(&mut self, source_url: &str) {
        self.primed.insert(source_url.to_string());
    }

    pub fn is_purchase_attempted(&self, key: &ListingKey) -> bool {
        self.attempted.contains(key.as_str())
    }

    /// Idempotent. Returns `true` if the key was new.
    pub async fn mark_purchase_attempted(&mut self, key: &ListingKey) -> Result<bool> {
        if !self.attempted.insert(key.as_str().to_string()) {
            return Ok(false);
        }
        self.store
            .mark_purchase_attempted(self.user, key.as_str())
            .await
            .with_context(|| format!("persisting purchase attempt {key}"))?;
        Ok(true)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
