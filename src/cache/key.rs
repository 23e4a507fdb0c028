//! Query keys and per-key cache state

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque key identifying a cacheable operation.
///
/// Keys are usually JSON arrays such as `["todos", 1]`. Two keys are equal
/// when their canonical JSON text is equal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct QueryKey {
    parts: Value,
    canonical: String,
}

impl QueryKey {
    pub fn new(parts: Value) -> Self {
        let canonical = parts.to_string();
        Self { parts, canonical }
    }

    /// The JSON value the key was built from
    pub fn parts(&self) -> &Value {
        &self.parts
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl From<Value> for QueryKey {
    fn from(parts: Value) -> Self {
        Self::new(parts)
    }
}

impl From<QueryKey> for Value {
    fn from(key: QueryKey) -> Self {
        key.parts
    }
}

impl From<&str> for QueryKey {
    fn from(name: &str) -> Self {
        Self::new(Value::Array(vec![Value::String(name.to_string())]))
    }
}

/// Lifecycle status of a cached operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    /// Success and error are final for an operation instance
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one cached operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Number of fetches started for this key
    pub fetch_count: u32,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            fetch_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_key_equality_uses_canonical_json() {
        let a = QueryKey::new(json!(["test", 1]));
        let b: QueryKey = json!(["test", 1]).into();
        let c = QueryKey::new(json!(["test", 2]));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<QueryKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), r#"["test",1]"#);
    }

    #[test]
    fn test_key_serde() {
        let key = QueryKey::from("todos");
        let encoded = serde_json::to_value(&key).unwrap();
        assert_eq!(encoded, json!(["todos"]));
        let decoded: QueryKey = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(QueryStatus::Success.is_terminal());
        assert!(QueryStatus::Error.is_terminal());
        assert!(!QueryStatus::Idle.is_terminal());
        assert!(!QueryStatus::Loading.is_terminal());
        assert_eq!(serde_json::to_value(QueryStatus::Loading).unwrap(), json!("loading"));
    }
}
