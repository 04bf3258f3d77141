//! listing-hunter: binary entrypoint.
//! Loads config, opens the state file, applies the `[[users]]` bootstrap,
//! starts autostart sessions and the error reporter, stops on Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use listing_hunter::fetch::{FetchClient, RetryPolicy};
use listing_hunter::http::HttpContext;
use listing_hunter::notify::NotifierMux;
use listing_hunter::purchase::PurchaseExecutor;
use listing_hunter::report::{ErrorAggregator, ErrorReporter};
use listing_hunter::session::SessionRegistry;
use listing_hunter::sources::normalize_url;
use listing_hunter::store::{JsonFileStore, Store};
use listing_hunter::telemetry;
use listing_hunter::worker::WorkerDeps;
use listing_hunter::HunterConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; missing file is fine.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let cfg = Arc::new(HunterConfig::load_default()?);
    if let Some(addr) = cfg.metrics_addr.as_deref() {
        telemetry::install_prometheus(addr)?;
    }
    if cfg.api_key.is_none() {
        tracing::warn!(target: "main", "LZT_API_KEY is not set; requests go out unauthenticated");
    }

    let store: Arc<dyn Store> = Arc::new(
        JsonFileStore::open(&cfg.store_path)
            .await
            .with_context(|| format!("opening state file {}", cfg.store_path.display()))?,
    );
    let http = HttpContext::from_config(&cfg)?;
    let notifier = Arc::new(NotifierMux::from_token(cfg.bot_token.as_deref()));
    let errors = Arc::new(ErrorAggregator::new());

    let deps = WorkerDeps {
        store: store.clone(),
        fetcher: Arc::new(FetchClient::new(http.clone(), RetryPolicy::from_config(&cfg))),
        purchaser: Arc::new(PurchaseExecutor::from_config(http, &cfg)),
        notifier: notifier.clone(),
        errors: errors.clone(),
        cfg: cfg.clone(),
    };

    let root = CancellationToken::new();
    let registry = SessionRegistry::new(deps, root.clone());

    let autostart = bootstrap_users(&cfg, store.as_ref(), &registry).await?;
    for user in autostart {
        if let Err(e) = registry.start(user) {
            tracing::warn!(target: "main", user, error = %e, "autostart skipped");
        }
    }

    let reporter = ErrorReporter::new(errors, store, notifier, cfg.error_report_interval())
        .spawn(root.child_token());

    tracing::info!(
        target: "main",
        sessions = registry.active_users().len(),
        "listing hunter running; Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    tracing::info!(target: "main", "shutting down");
    root.cancel();
    registry.shutdown().await;
    if let Err(e) = reporter.await {
        tracing::warn!(target: "main", error = %e, "error reporter ended abnormally");
    }
    Ok(())
}

/// Apply `[[users]]`: role, sources (normalized, stored as given), filter.
/// Returns the users marked `autostart`.
async fn bootstrap_users(
    cfg: &HunterConfig,
    store: &dyn Store,
    registry: &SessionRegistry,
) -> Result<Vec<listing_hunter::UserId>> {
    let mut autostart = Vec::new();
    for u in &cfg.users {
        store.ensure_user(u.id).await?;
        store.set_role(u.id, u.role).await?;
        for s in &u.sources {
            let url = normalize_url(&s.url);
            if url.is_empty() {
                continue;
            }
            store.add_source(u.id, &url).await?;
            store.set_enabled(u.id, &url, s.enabled).await?;
            store.set_autobuy(u.id, &url, s.autobuy).await?;
        }
        let filter = u.filter();
        if !filter.is_empty() {
            registry.set_filter(u.id, filter);
        }
        if u.autostart {
            autostart.push(u.id);
        }
        tracing::info!(
            target: "main",
            user = u.id,
            role = ?u.role,
            sources = u.sources.len(),
            "user bootstrapped"
        );
    }
    Ok(autostart)
}
