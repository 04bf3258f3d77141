// src/notify/card.rs
//! HTML listing card for chat delivery.

use serde_json::Value;

use crate::listing::{value_text, Listing};

/// Cards longer than this are cut.
pub const CARD_MAX_CHARS: usize = 900;
const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

fn esc(s: &str) -> String {
    html_escape::encode_text(s).into_owned()
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|x| x != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "0",
        Some(_) => true,
    }
}

/// Seller summary from a string or an object with username/sales stats.
fn seller_line(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(esc(s)),
        Value::Object(m) => {
            let mut parts = Vec::new();
            if let Some(name) = ["username", "user", "name"]
                .iter()
                .filter_map(|k| m.get(*k))
                .map(value_text)
                .find(|s| !s.is_empty())
            {
                parts.push(format!("👤 {}", esc(&name)));
            }
            if let Some(sold) = m.get("sold_items_count").filter(|v| !v.is_null()) {
                parts.push(format!("📦 Sold: {}", esc(&value_text(sold))));
            }
            if let Some(active) = m.get("active_items_count").filter(|v| !v.is_null()) {
                parts.push(format!("🔸 Active: {}", esc(&value_text(active))));
            }
            if let Some(restore) = m.get("restore_percents").filter(|v| !v.is_null()) {
                parts.push(format!("🛠 Restore: {}%", esc(&value_text(restore))));
            }
            if parts.is_empty() {
                Some(esc(&v.to_string()))
            } else {
                Some(parts.join(" | "))
            }
        }
        other => Some(esc(&value_text(other))),
    }
}

pub fn make_card(item: &Listing, source_label: &str) -> String {
    let title = item.title().unwrap_or_else(|| "Untitled".to_string());
    let mut lines = vec![
        RULE.to_string(),
        format!("🔎 <b>{}</b>", esc(source_label)),
        format!("🎮 <b>{}</b>", esc(&title)),
    ];

    if let Some(level) = item.first_text(&["level", "lvl", "user_level"]) {
        lines.push(format!("🔼 Level: {}", esc(&level)));
    }
    if let Some(cups) = item.first_text(&["trophies", "cups", "brawl_cup"]) {
        lines.push(format!("🏆 Trophies: {}", esc(&cups)));
    }
    if let Some(th) = item.first_text(&["townhall", "ratsha", "th"]) {
        lines.push(format!("🏰 Town hall: {}", esc(&th)));
    }
    if let Some(bb) = item.first_text(&["builder_level", "bb_level"]) {
        lines.push(format!("🔧 Builder base: {}", esc(&bb)));
    }
    if let Some(seller) = ["seller", "user", "owner"]
        .iter()
        .filter_map(|k| item.get(k))
        .find_map(seller_line)
    {
        lines.push(seller);
    }
    if let Some(created) = item.first_text(&["created_at", "date", "added_at"]) {
        lines.push(format!("📅 Listed: {}", esc(&created)));
    }

    let f = item.fields();
    let mut flags = Vec::new();
    if truthy(f.get("discount")) || truthy(f.get("sale")) || truthy(f.get("discount_percent")) {
        flags.push("Discount");
    }
    if truthy(f.get("phone_bound")) || truthy(f.get("phone")) {
        flags.push("Phone bound");
    }
    if truthy(f.get("guarantee")) || truthy(f.get("warranty")) {
        flags.push("Guarantee");
    }
    if !flags.is_empty() {
        lines.push(format!("🔖 {}", flags.join(", ")));
    }
    if let Some(g) = item.first_text(&["guarantee", "warranty", "guarantee_text"]) {
        lines.push(format!("🛡 {}", esc(&g)));
    }
    if let Some(phone) = ["phone_bound", "phone", "phone_bound_flag"]
        .iter()
        .find_map(|k| item.get(k))
    {
        let yes = if truthy(Some(phone)) { "Yes" } else { "No" };
        lines.push(format!("📱 Phone bound: {yes}"));
    }

    match item.price_text() {
        Some(p) => lines.push(format!("💰 {}₽", esc(&p))),
        None => lines.push("💰 —".to_string()),
    }
    lines.push(format!(
        "🆔 {}",
        esc(&item.item_id().unwrap_or_else(|| "—".to_string()))
    ));
    lines.push(RULE.to_string());

    truncate_card(lines.join("\n"))
}

fn truncate_card(card: String) -> String {
    if card.chars().count() <= CARD_MAX_CHARS {
        return card;
    }
    let head: String = card.chars().take(CARD_MAX_CHARS - 100).collect();
    format!("{head}\n... (truncated)")
}

/// Marketplace page for a listing with an item id (`item_id`, else `id`).
pub fn listing_link(item: &Listing) -> Option<String> {
    item.item_id().map(|id| format!("https://lzt.market/{id}"))
}
