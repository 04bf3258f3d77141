// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod fetch;
pub mod filter;
pub mod http;
pub mod ledger;
pub mod listing;
pub mod sources;
pub mod store;
pub mod telemetry;

// Outbound side effects
pub mod notify;
pub mod purchase;
pub mod report;

// Session lifecycle
pub mod session;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::config::HunterConfig;
pub use crate::fetch::{FetchClient, FetchError, FetchOutcome, ListingFetcher, RetryPolicy};
pub use crate::filter::{FilterHandle, FilterSettings};
pub use crate::listing::{Listing, ListingKey};
pub use crate::notify::{Notification, Notifier, NotifierMux};
pub use crate::purchase::{PurchaseExecutor, PurchaseOutcome, PurchaseReport, Purchaser};
pub use crate::session::{SessionError, SessionRegistry};
pub use crate::store::{JsonFileStore, MemoryStore, Role, Store, UserId};
pub use crate::worker::{PollingWorker, WorkerDeps};
