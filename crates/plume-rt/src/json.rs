//! Structured-value codec shared by json/jsonb marshaling and the script `json` helpers.

use serde_json::{Map, Value};

pub fn parse(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|err| format!("invalid json: {err}"))
}

pub fn encode(value: &Value) -> String {
    value.to_string()
}

/// Canonical binary-json ordering: keys sorted at every level.
pub fn sort_keys(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        other => other,
    }
}
