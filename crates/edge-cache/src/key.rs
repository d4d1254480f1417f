//! Suspense key composition.

use std::collections::BTreeMap;

use edge_core::{StreamError, StreamResult};
use serde::Serialize;
use serde_json::Value;

/// Separator between the logical key and the instance id.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Dependency list attached to a cached value.
pub type Deps = Vec<Value>;

/// Composite key of a suspense entry: `(logical, instance)`.
///
/// The logical key names the computation. The instance id names the unit
/// of work requesting it and may change between passes until the value
/// resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuspenseKey {
    logical: String,
    instance: String,
    id: String,
}

impl SuspenseKey {
    /// Create a key from an already stringified logical key.
    pub fn new(logical: impl Into<String>, instance: impl Into<String>) -> StreamResult<Self> {
        let logical = logical.into();
        let instance = instance.into();

        if logical.is_empty() {
            return Err(StreamError::usage("suspense key must not be empty"));
        }
        for (part, value) in [("key", &logical), ("instance id", &instance)] {
            if value.contains(KEY_SEPARATOR) {
                return Err(StreamError::usage(format!(
                    "suspense {} {:?} contains the reserved separator U+001F",
                    part, value
                )));
            }
        }

        let id = format!("{}{}{}", logical, KEY_SEPARATOR, instance);
        Ok(Self {
            logical,
            instance,
            id,
        })
    }

    /// Create a key from any serializable user key.
    ///
    /// The user key is stringified canonically, so `{"b":1,"a":2}` and
    /// `{"a":2,"b":1}` name the same computation.
    pub fn from_key<K>(key: &K, instance: impl Into<String>) -> StreamResult<Self>
    where
        K: Serialize + ?Sized,
    {
        Self::new(stringify_key(key)?, instance)
    }

    /// The composite id used in the per-pass table.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stringified logical key.
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// The instance id.
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl std::fmt::Display for SuspenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}", self.logical)
        } else {
            write!(f, "{}@{}", self.logical, self.instance)
        }
    }
}

/// Stringify a user key as canonical JSON with sorted object keys.
///
/// `null`, `false`, `0` and `""` are rejected.
pub fn stringify_key<K>(key: &K) -> StreamResult<String>
where
    K: Serialize + ?Sized,
{
    let value = serde_json::to_value(key)
        .map_err(|e| StreamError::usage(format!("suspense key is not serializable: {}", e)))?;
    if is_empty_key(&value) {
        return Err(StreamError::usage(format!(
            "suspense key `{}` is forbidden; use a non-empty value",
            value
        )));
    }
    serde_json::to_string(&canonicalize(value))
        .map_err(|e| StreamError::internal(format!("failed to stringify suspense key: {}", e)))
}

/// Check whether two dependency lists differ.
pub fn deps_changed(previous: &[Value], next: &[Value]) -> bool {
    previous.len() != next.len() || previous.iter().zip(next).any(|(a, b)| a != b)
}

fn is_empty_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
