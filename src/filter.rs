// src/filter.rs
//! Listing filter: a pure predicate over one listing and the user's settings.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::listing::Listing;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Case-insensitive substring required in the title.
    #[serde(default)]
    pub title_phrase: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
}

impl FilterSettings {
    pub fn with_title(phrase: impl Into<String>) -> Self {
        Self {
            title_phrase: Some(phrase.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phrase().is_none() && self.min_price.is_none() && self.max_price.is_none()
    }

    fn phrase(&self) -> Option<&str> {
        self.title_phrase
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// `true` when the listing satisfies every configured predicate. Unset
/// predicates never reject; a price bound rejects listings without a price.
pub fn passes(listing: &Listing, f: &FilterSettings) -> bool {
    if let Some(phrase) = f.phrase() {
        let title = listing.title().unwrap_or_default().to_lowercase();
        if !title.contains(&phrase.to_lowercase()) {
            return false;
        }
    }
    if f.min_price.is_some() || f.max_price.is_some() {
        let Some(price) = listing.price() else {
            return false;
        };
        if f.min_price.is_some_and(|min| price < min) {
            return false;
        }
        if f.max_price.is_some_and(|max| price > max) {
            return false;
        }
    }
    true
}

/// Shared, live-editable filter for one user. The polling worker snapshots it
/// once per cycle, so edits apply from the next cycle on.
#[derive(Clone, Default)]
pub struct FilterHandle {
    inner: Arc<RwLock<FilterSettings>>,
}

impl FilterHandle {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> FilterSettings {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, settings: FilterSettings) {
        match self.inner.write() {
            Ok(mut g) => *g = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}
