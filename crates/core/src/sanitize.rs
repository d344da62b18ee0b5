//! Log-safe rendering of inbound messages.
//!
//! Job messages carry base64 images and bearer tokens. Before a message
//! is logged, keys containing `jwt` are dropped, lists are summarised by
//! length and long strings are truncated.

use serde_json::{Map, Value};

/// Strings longer than this many characters are truncated.
const MAX_STRING_CHARS: usize = 64;

/// Produce a copy of `message` that is safe to write to logs.
///
/// Nested objects are sanitised recursively.
pub fn sanitize_for_log(message: &Value) -> Value {
    match message {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => summarise_list(items),
        Value::String(s) => truncate(s),
        other => other.clone(),
    }
}

fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !key.to_ascii_lowercase().contains("jwt"))
        .map(|(key, value)| (key.clone(), sanitize_for_log(value)))
        .collect()
}

fn summarise_list(items: &[Value]) -> Value {
    Value::String(format!("List with {} items", items.len()))
}

fn truncate(s: &str) -> Value {
    if s.chars().count() <= MAX_STRING_CHARS {
        return Value::String(s.to_string());
    }
    let head: String = s.chars().take(MAX_STRING_CHARS).collect();
    Value::String(format!("{head}..truncated for print.."))
}
