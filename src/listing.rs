// src/listing.rs
//! Listings are opaque JSON objects from the source; only identity and a few
//! display fields are interpreted.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Listing(Map<String, Value>);

impl Listing {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects; anything else in a source list is skipped.
    pub fn from_value(v: Value) -> Option<Self> {
        match v {
            Value::Object(m) => Some(Self(m)),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// First present, non-empty field among `names`, rendered as text.
    pub fn first_text(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|n| self.get(n))
            .map(value_text)
            .find(|s| !s.is_empty())
    }

    /// `item_id`, falling back to `id`.
    pub fn item_id(&self) -> Option<String> {
        self.first_text(&["item_id", "id"])
    }

    pub fn title(&self) -> Option<String> {
        self.first_text(&["title"])
    }

    pub fn price_text(&self) -> Option<String> {
        self.first_text(&["price"])
    }

    pub fn price(&self) -> Option<f64> {
        match self.get("price")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey::of(self)
    }
}

impl From<Map<String, Value>> for Listing {
    fn from(m: Map<String, Value>) -> Self {
        Self(m)
    }
}

/// Canonical identity of a listing: `id:<item id>` or, without an id,
/// `noid:<title>_<price>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListingKey(String);

impl ListingKey {
    pub fn of(listing: &Listing) -> Self {
        match listing.item_id() {
            Some(id) => Self(format!("id:{id}")),
            None => Self(format!(
                "noid:{}_{}",
                listing.title().unwrap_or_default(),
                listing.price_text().unwrap_or_default()
            )),
        }
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strings verbatim, everything else in its JSON form.
pub(crate) fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
