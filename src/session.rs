// src/session.rs
//! Session registry: at most one polling task per user, per-user live filter
//! handles, and status snapshots.

use anyhow::Result;
use metrics::gauge;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::filter::{FilterHandle, FilterSettings};
use crate::sources::enabled_sources;
use crate::store::{Role, UserId};
use crate::worker::{PollingWorker, WorkerDeps};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a session is already running for user {0}")]
    AlreadyRunning(UserId),
    #[error("no session is running for user {0}")]
    NotRunning(UserId),
    #[error("the session for user {0} is still stopping")]
    Stopping(UserId),
}

struct SessionState {
    /// Distinguishes a restarted session from the one it replaced.
    id: u64,
    cancel: CancellationToken,
    /// Taken by whoever is stopping the session; the entry stays until the
    /// task has finished so no second worker can start next to it.
    handle: Option<JoinHandle<()>>,
}

impl SessionState {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

type SessionMap = Arc<Mutex<HashMap<UserId, SessionState>>>;

fn lock(map: &SessionMap) -> MutexGuard<'_, HashMap<UserId, SessionState>> {
    match map.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn publish_count(n: usize) {
    gauge!("hunter_active_sessions").set(n as f64);
}

pub struct SessionRegistry {
    deps: WorkerDeps,
    root: CancellationToken,
    sessions: SessionMap,
    filters: Mutex<HashMap<UserId, FilterHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Every session runs on a child of `root`; cancelling it stops them all.
    pub fn new(deps: WorkerDeps, root: CancellationToken) -> Self {
        Self {
            deps,
            root,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            filters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The user's shared filter handle, created empty on first use.
    pub fn filter(&self, user: UserId) -> FilterHandle {
        let mut filters = match self.filters.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        filters.entry(user).or_default().clone()
    }

    /// Takes effect from the running session's next cycle.
    pub fn set_filter(&self, user: UserId, settings: FilterSettings) {
        self.filter(user).set(settings);
    }

    pub fn clear_filter(&self, user: UserId) {
        self.filter(user).set(FilterSettings::default());
    }

    pub fn start(&self, user: UserId) -> Result<(), SessionError> {
        let mut sessions = lock(&self.sessions);
        if let Some(s) = sessions.get(&user) {
            if s.handle.is_none() {
                return Err(SessionError::Stopping(user));
            }
            if s.is_running() {
                return Err(SessionError::AlreadyRunning(user));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        let worker = PollingWorker::new(user, self.deps.clone(), self.filter(user), cancel.clone());
        let registry = Arc::clone(&self.sessions);
        // spawned under the lock, so the entry exists before the task can
        // try to remove it
        let handle = tokio::spawn(async move {
            worker.run().await;
            let mut sessions = lock(&registry);
            if sessions.get(&user).is_some_and(|s| s.id == id) {
                sessions.remove(&user);
            }
            publish_count(sessions.len());
        });
        sessions.insert(
            user,
            SessionState {
                id,
                cancel,
                handle: Some(handle),
            },
        );
        publish_count(sessions.len());
        tracing::info!(target: "session", user, "session started");
        Ok(())
    }

    /// Cancel and wait for the session; in-flight requests finish first.
    /// The user stays registered as stopping until the task has ended.
    pub async fn stop(&self, user: UserId) -> Result<(), SessionError> {
        let (id, handle) = {
            let mut sessions = lock(&self.sessions);
            let state = sessions.get_mut(&user).ok_or(SessionError::NotRunning(user))?;
            let handle = state.handle.take().ok_or(SessionError::Stopping(user))?;
            state.cancel.cancel();
            (state.id, handle)
        };
        if let Err(e) = handle.await {
            tracing::warn!(target: "session", user, error = %e, "session task ended abnormally");
        }
        self.forget(user, id);
        tracing::info!(target: "session", user, "session stopped");
        Ok(())
    }

    /// Drop the entry left behind by a task that did not remove itself.
    fn forget(&self, user: UserId, id: u64) {
        let mut sessions = lock(&self.sessions);
        if sessions.get(&user).is_some_and(|s| s.id == id) {
            sessions.remove(&user);
        }
        publish_count(sessions.len());
    }

    pub fn is_active(&self, user: UserId) -> bool {
        lock(&self.sessions)
            .get(&user)
            .is_some_and(SessionState::is_running)
    }

    pub fn active_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = lock(&self.sessions)
            .iter()
            .filter(|(_, s)| s.handle.is_some())
            .map(|(user, _)| *user)
            .collect();
        users.sort_unstable();
        users
    }

    pub async fn status(&self, user: UserId) -> Result<UserStatus> {
        let store = &self.deps.store;
        let role = store.role(user).await?;
        let sources = store.sources(user).await?;
        let seen = store.load_seen(user).await?.len();
        Ok(UserStatus {
            user,
            active: self.is_active(user),
            role,
            sources_total: sources.len(),
            sources_enabled: enabled_sources(&sources).len(),
            sources_autobuy: sources.iter().filter(|s| s.autobuy).count(),
            seen,
            errors: self.deps.errors.count(user),
            filter: self.filter(user).snapshot(),
        })
    }

    /// Cancel every session and wait for all of them. Returns how many were
    /// still running; sessions already being stopped are left to `stop`.
    pub async fn shutdown(&self) -> usize {
        let taken: Vec<(UserId, u64, JoinHandle<()>)> = {
            let mut sessions = lock(&self.sessions);
            sessions
                .iter_mut()
                .filter_map(|(user, s)| {
                    let handle = s.handle.take()?;
                    s.cancel.cancel();
                    Some((*user, s.id, handle))
                })
                .collect()
        };
        let n = taken.len();
        for (user, id, handle) in taken {
            if let Err(e) = handle.await {
                tracing::warn!(target: "session", user, error = %e, "session task ended abnormally");
            }
            self.forget(user, id);
        }
        tracing::info!(target: "session", stopped = n, "all sessions stopped");
        n
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserStatus {
    pub user: UserId,
    pub active: bool,
    pub role: Role,
    pub sources_total: usize,
    pub sources_enabled: usize,
    pub sources_autobuy: usize,
    pub seen: usize,
    pub errors: u64,
    pub filter: FilterSettings,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.active { "running" } else { "stopped" };
        writeln!(f, "Hunter: {state}")?;
        writeln!(f, "Role: {:?}", self.role)?;
        writeln!(
            f,
            "Sources: {} enabled of {} ({} with autobuy)",
            self.sources_enabled, self.sources_total, self.sources_autobuy
        )?;
        writeln!(f, "Seen listings: {}", self.seen)?;
        writeln!(f, "Pending errors: {}", self.errors)?;
        match self.filter.title_phrase.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => write!(f, "Filter: \"{p}\"")?,
            _ => write!(f, "Filter: none")?,
        }
        if let Some(min) = self.filter.min_price {
            write!(f, ", min {min}")?;
        }
        if let Some(max) = self.filter.max_price {
            write!(f, ", max {max}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HunterConfig;
    use crate::fetch::{FetchOutcome, ListingFetcher};
    use crate::listing::Listing;
    use crate::notify::NotifierMux;
    use crate::purchase::{PurchaseOutcome, PurchaseReport, Purchaser};
    use crate::report::ErrorAggregator;
    use crate::store::{MemoryStore, Store};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Empty;

    #[async_trait::async_trait]
    impl ListingFetcher for Empty {
        async fn fetch(&self, _url: &str) -> FetchOutcome {
            FetchOutcome::ok(vec![])
        }
    }

    #[async_trait::async_trait]
    impl Purchaser for Empty {
        async fn purchase(
            &self,
            _source_url: &str,
            _listing: &Listing,
            _cancel: &CancellationToken,
        ) -> PurchaseReport {
            PurchaseReport {
                outcome: PurchaseOutcome::Exhausted,
                detail: String::new(),
                probes: 0,
            }
        }
    }

    /// Holds every request open for five seconds and tracks how many overlap.
    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        max: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ListingFetcher for Slow {
        async fn fetch(&self, _url: &str) -> FetchOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            FetchOutcome::ok(vec![])
        }
    }

    fn registry(store: Arc<MemoryStore>, root: CancellationToken) -> SessionRegistry {
        registry_with(store, root, Arc::new(Empty))
    }

    fn registry_with(
        store: Arc<MemoryStore>,
        root: CancellationToken,
        fetcher: Arc<dyn ListingFetcher>,
    ) -> SessionRegistry {
        let deps = WorkerDeps {
            store,
            fetcher,
            purchaser: Arc::new(Empty),
            notifier: Arc::new(NotifierMux::default()),
            errors: Arc::new(ErrorAggregator::new()),
            cfg: Arc::new(HunterConfig::default()),
        };
        SessionRegistry::new(deps, root)
    }

    #[tokio::test(start_paused = true)]
    async fn one_session_per_user() {
        let reg = registry(Arc::new(MemoryStore::new()), CancellationToken::new());
        reg.start(1).unwrap();
        assert_eq!(reg.start(1), Err(SessionError::AlreadyRunning(1)));
        reg.start(2).unwrap();
        assert_eq!(reg.active_users(), vec![1, 2]);

        reg.stop(1).await.unwrap();
        assert!(!reg.is_active(1));
        assert_eq!(reg.stop(1).await, Err(SessionError::NotRunning(1)));

        // a stopped user can start again
        reg.start(1).unwrap();
        assert_eq!(reg.shutdown().await, 2);
        assert!(reg.active_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_refused_until_the_old_worker_has_finished() {
        let store = Arc::new(MemoryStore::new());
        store.add_source(1, "https://api.lzt.market/a").await.unwrap();
        let slow = Arc::new(Slow::default());
        let reg = Arc::new(registry_with(store, CancellationToken::new(), slow.clone()));

        reg.start(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 1);

        let stopping = tokio::spawn({
            let reg = Arc::clone(&reg);
            async move { reg.stop(1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the old request is still open
        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(reg.start(1), Err(SessionError::Stopping(1)));
        assert_eq!(reg.stop(1).await, Err(SessionError::Stopping(1)));
        assert!(!reg.is_active(1));
        assert!(reg.active_users().is_empty());

        stopping.await.unwrap().unwrap();
        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 0);
        reg.start(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reg.shutdown().await, 1);
        assert_eq!(slow.max.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sessions_remove_themselves() {
        let root = CancellationToken::new();
        let reg = registry(Arc::new(MemoryStore::new()), root.clone());
        reg.start(1).unwrap();
        reg.start(2).unwrap();

        root.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.active_users().is_empty());
        assert_eq!(reg.shutdown().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_sources_and_filter() {
        let store = Arc::new(MemoryStore::new());
        store.add_source(5, "https://api.lzt.market/a").await.unwrap();
        store.add_source(5, "https://api.lzt.market/b").await.unwrap();
        store.set_enabled(5, "https://api.lzt.market/b", false).await.unwrap();
        store.set_autobuy(5, "https://api.lzt.market/a", true).await.unwrap();
        store.mark_seen(5, "id:1").await.unwrap();
        let reg = registry(store, CancellationToken::new());
        reg.set_filter(5, FilterSettings::with_title("Genshin"));

        let st = reg.status(5).await.unwrap();
        assert!(!st.active);
        assert_eq!((st.sources_total, st.sources_enabled, st.sources_autobuy), (2, 1, 1));
        assert_eq!(st.seen, 1);
        let text = st.to_string();
        assert!(text.contains("Hunter: stopped"));
        assert!(text.contains("Filter: \"Genshin\""));

        reg.clear_filter(5);
        assert!(reg.status(5).await.unwrap().to_string().contains("Filter: none"));
    }

    #[tokio::test]
    async fn filter_handle_is_shared() {
        let reg = registry(Arc::new(MemoryStore::new()), CancellationToken::new());
        let h = reg.filter(3);
        reg.set_filter(3, FilterSettings::with_title("x"));
        assert_eq!(h.snapshot().title_phrase.as_deref(), Some("x"));
    }
}
