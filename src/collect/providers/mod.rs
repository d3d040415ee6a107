// src/collect/providers/mod.rs
pub mod interest;
pub mod keyword_api;
pub mod markup;
pub mod rendered;
pub mod rss;
pub mod youtube;

/// Numeric value from a JSON number or a numeric string ("1,234" allowed).
pub(crate) fn json_number(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}
