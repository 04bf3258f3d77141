// src/telemetry.rs
//! Tracing bootstrap and metric registration.

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "hunter_fetch_attempts_total",
            "Outbound listing fetch requests."
        );
        describe_counter!(
            "hunter_fetch_errors_total",
            "Failed listing fetch attempts (before retry)."
        );
        describe_counter!(
            "hunter_listings_seen_total",
            "Listing keys newly marked seen."
        );
        describe_counter!(
            "hunter_notifications_total",
            "Listing notifications handed to the notifier."
        );
        describe_counter!(
            "hunter_purchase_probes_total",
            "Individual purchase probe requests."
        );
        describe_counter!(
            "hunter_purchase_outcomes_total",
            "Finished purchase attempts by outcome."
        );
        describe_counter!(
            "hunter_loop_faults_total",
            "Polling iterations that ended in an unexpected fault."
        );
        describe_gauge!("hunter_active_sessions", "Currently running sessions.");
    });
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("listing_hunter=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialized: {e}");
    }
}

/// Start the Prometheus scrape endpoint on `addr`.
pub fn install_prometheus(addr: &str) -> anyhow::Result<()> {
    let socket: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics_addr {addr}: {e}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(socket)
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus: install exporter: {e}"))?;
    ensure_metrics_described();
    tracing::info!(target: "telemetry", %socket, "prometheus exporter listening");
    Ok(())
}
