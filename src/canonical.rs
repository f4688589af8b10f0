//! Canonical JSON rendering for stamp computation.
//!
//! Producer and verifier must hash byte-identical serializations of a
//! request regardless of member order, so stamps are computed over a
//! canonical rendering: object keys sorted lexicographically by Unicode
//! code point, no whitespace between tokens, applied recursively.

use serde_json::Value;

/// Render a JSON value canonically: sorted keys, no whitespace.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => {
            serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
        }
        Value::Array(arr) => {
            let elements: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", elements.join(","))
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .iter()
                .map(|k| {
                    let key = serde_json::to_string(*k).unwrap_or_else(|_| format!("\"{}\"", k));
                    let val = canonicalize(obj.get(*k).expect("key came from this object"));
                    format!("{}:{}", key, val)
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}
