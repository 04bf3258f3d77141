// src/store/json_file.rs
//! Whole-state JSON snapshot on disk. A mutation updates memory and
//! serializes under the state lock, then writes the file (temp file + rename)
//! under a separate writer lock. Readers never wait on disk I/O, and a
//! snapshot older than the last one written is dropped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

use super::{now_unix, Role, Store, StoreState, UserId};
use crate::sources::Source;

pub struct JsonFileStore {
    path: PathBuf,
    inner: Mutex<StoreState>,
    /// Bumped under `inner` for every changed state.
    generation: AtomicU64,
    /// Generation of the snapshot currently on disk.
    written: Mutex<u64>,
    writes: AtomicU64,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`. A missing file is an empty
    /// store; an unreadable one is an error so state is never silently lost.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => StoreState::default(),
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing store file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading store file {}", path.display()))
            }
        };
        tracing::info!(
            target: "store",
            path = %path.display(),
            users = state.users.len(),
            "store opened"
        );
        Ok(Self {
            path,
            inner: Mutex::new(state),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshots written to disk since open.
    pub fn snapshots_written(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn persist(&self, generation: u64, bytes: Vec<u8>) -> Result<()> {
        let mut written = self.written.lock().await;
        if *written >= generation {
            return Ok(());
        }
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating store dir {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        *written = generation;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> (T, bool)) -> Result<T> {
        let (out, generation, bytes) = {
            let mut st = self.inner.lock().await;
            let (out, changed) = f(&mut st);
            if !changed {
                return Ok(out);
            }
            let bytes = serde_json::to_vec_pretty(&*st).context("serializing store")?;
            (out, self.generation.fetch_add(1, Ordering::Relaxed) + 1, bytes)
        };
        self.persist(generation, bytes).await?;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let st = self.inner.lock().await;
        f(&st)
    }
}

#[async_trait::async_trait]
impl Store for JsonFileStore {
    async fn known_users(&self) -> Result<Vec<UserId>> {
        Ok(self.read(|st| st.users.keys().copied().collect()).await)
    }

    async fn ensure_user(&self, user: UserId) -> Result<()> {
        self.mutate(|st| ((), st.ensure_user(user))).await
    }

    async fn role(&self, user: UserId) -> Result<Role> {
        Ok(self.read(|st| st.role(user)).await)
    }

    async fn set_role(&self, user: UserId, role: Role) -> Result<()> {
        self.mutate(|st| ((), st.set_role(user, role))).await
    }

    async fn sources(&self, user: UserId) -> Result<Vec<Source>> {
        Ok(self.read(|st| st.sources(user)).await)
    }

    async fn add_source(&self, user: UserId, url: &str) -> Result<bool> {
        self.mutate(|st| {
            let added = st.add_source(user, url);
            (added, added)
        })
        .await
    }

    async fn remove_source(&self, user: UserId, url: &str) -> Result<bool> {
        self.mutate(|st| {
            let removed = st.remove_source(user, url);
            (removed, removed)
        })
        .await
    }

    async fn set_enabled(&self, user: UserId, url: &str, enabled: bool) -> Result<bool> {
        self.mutate(|st| {
            let found = st.update_source(user, url, |s| {
                s.enabled = enabled;
                true
            });
            (found, found)
        })
        .await
    }

    async fn set_autobuy(&self, user: UserId, url: &str, autobuy: bool) -> Result<bool> {
        self.mutate(|st| {
            let found = st.update_source(user, url, |s| {
                s.autobuy = autobuy;
                true
            });
            (found, found)
        })
        .await
    }

    async fn is_seen(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.read(|st| st.is_seen(user, key)).await)
    }

    async fn mark_seen(&self, user: UserId, key: &str) -> Result<bool> {
        self.mutate(|st| {
            let fresh = st.mark_seen(user, key, now_unix());
            (fresh, fresh)
        })
        .await
    }

    async fn mark_seen_many(&self, user: UserId, keys: &[String]) -> Result<usize> {
        self.mutate(|st| {
            let fresh = st.mark_seen_many(user, keys, now_unix());
            (fresh, fresh > 0)
        })
        .await
    }

    async fn load_seen(&self, user: UserId) -> Result<HashSet<String>> {
        Ok(self.read(|st| st.load_seen(user)).await)
    }

    async fn is_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool> {
        Ok(self.read(|st| st.is_purchase_attempted(user, key)).await)
    }

    async fn mark_purchase_attempted(&self, user: UserId, key: &str) -> Result<bool> {
        self.mutate(|st| {
            let fresh = st.mark_purchase_attempted(user, key, now_unix());
            (fresh, fresh)
        })
        .await
    }

    async fn load_purchase_attempts(&self, user: UserId) -> Result<HashSet<String>> {
        Ok(self.read(|st| st.load_purchase_attempts(user)).await)
    }

    async fn last_error_report(&self, user: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read(|st| st.last_error_report(user)).await)
    }

    async fn set_last_error_report(&self, user: UserId, ts: DateTime<Utc>) -> Result<()> {
        self.mutate(|st| ((), st.set_last_error_report(user, ts))).await
    }
}
