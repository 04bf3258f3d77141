// src/purchase/candidates.rs
//! Ordered probe candidates: host × path template × payload variant ×
//! encoding. The order is fixed so probing is deterministic.

use serde_json::{Map, Value};

use crate::listing::{value_text, Listing};

/// Alternate spellings of the security-question answer field.
const SECRET_FIELDS: &[&str] = &["secret_answer", "secret_word", "qa_answer", "answer"];
const PRICE_FIELDS: &[&str] = &["price"];
const PATH_TEMPLATES: &[&str] = &[
    "/{id}/buy",
    "/{id}/fast-buy",
    "/market/{id}/buy",
    "/market/{id}/fast-buy",
    "/items/{id}/buy",
    "/items/{id}/fast-buy",
];
const LOLZ_HOST: &str = "https://api.lolz.live";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Form,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Form => "form",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub payload: Map<String, Value>,
    pub encoding: Encoding,
}

impl Candidate {
    pub fn new(url: impl Into<String>, payload: Map<String, Value>, encoding: Encoding) -> Self {
        Self {
            url: url.into(),
            payload,
            encoding,
        }
    }

    /// Flattened key/value pairs for form encoding.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        self.payload
            .iter()
            .map(|(k, v)| (k.clone(), value_text(v)))
            .collect()
    }

    pub fn describe(&self) -> String {
        match self.encoding {
            Encoding::Json => self.url.clone(),
            Encoding::Form => format!("{} (form)", self.url),
        }
    }
}

/// Source origin first, then fallbacks, order-preserving and deduplicated.
/// A source on the lolz mirror puts that mirror in front.
pub fn candidate_hosts(source_url: &str, fallback_hosts: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();
    if source_url.to_ascii_lowercase().contains("api.lolz.live") {
        hosts.push(LOLZ_HOST.to_string());
    }
    if let Ok(u) = reqwest::Url::parse(source_url.trim()) {
        let origin = u.origin();
        if origin.is_tuple() {
            hosts.push(origin.ascii_serialization());
        }
    }
    hosts.extend(fallback_hosts.iter().cloned());

    let mut out: Vec<String> = Vec::with_capacity(hosts.len());
    for h in hosts {
        let h = h.trim_end_matches('/').to_string();
        if !h.is_empty() && !out.contains(&h) {
            out.push(h);
        }
    }
    out
}

/// Base payload, base + explicit confirmation, base without price fields.
/// Identical variants collapse.
pub fn payload_variants(listing: &Listing, secret: Option<&str>) -> Vec<Map<String, Value>> {
    let mut base = Map::new();
    if let Some(price) = listing.get("price") {
        base.insert("price".to_string(), price.clone());
    }
    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        for f in SECRET_FIELDS {
            base.insert((*f).to_string(), Value::String(secret.to_string()));
        }
    }

    let mut confirmed = base.clone();
    confirmed.insert("confirm".to_string(), Value::from(1));
    confirmed.insert("is_confirmed".to_string(), Value::Bool(true));

    let mut no_price = base.clone();
    for f in PRICE_FIELDS {
        no_price.remove(*f);
    }

    let mut out: Vec<Map<String, Value>> = Vec::with_capacity(3);
    for v in [base, confirmed, no_price] {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

pub fn build_candidates(
    item_id: i64,
    listing: &Listing,
    source_url: &str,
    fallback_hosts: &[String],
    secret: Option<&str>,
) -> Vec<Candidate> {
    let hosts = candidate_hosts(source_url, fallback_hosts);
    let payloads = payload_variants(listing, secret);
    let id = item_id.to_string();

    let mut out = Vec::with_capacity(hosts.len() * PATH_TEMPLATES.len() * payloads.len() * 2);
    for host in &hosts {
        for tpl in PATH_TEMPLATES {
            let url = format!("{host}{}", tpl.replace("{id}", &id));
            for payload in &payloads {
                for encoding in [Encoding::Json, Encoding::Form] {
                    out.push(Candidate::new(url.clone(), payload.clone(), encoding));
                }
            }
        }
    }
    out
}
