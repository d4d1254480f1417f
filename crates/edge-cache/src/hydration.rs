//! Data islands: resolved values delivered alongside the streamed markup.
//!
//! The server injects one island per resolved value. The client scans the
//! islands it received and answers requests for the same key from them
//! instead of recomputing.

use edge_core::{StreamError, StreamResult};
use edge_observability::SUSPENSE_TARGET;
use edge_streaming::Chunk;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::key::{deps_changed, Deps};
use crate::tagged::{from_tagged_value, to_tagged_value};

/// Marker class of every data island.
pub const DATA_ISLAND_CLASS: &str = "edge-streaming_initData";

const SCRIPT_CLOSE: &str = "</script>";

/// Payload of one data island.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitData {
    /// Stringified logical key.
    pub key: String,
    /// The resolved value. Non-finite floats and strings starting with
    /// `!` are carried in tagged form.
    pub value: Value,
    /// Instance id of the unit of work that resolved it.
    #[serde(rename = "elementId", default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    /// Dependencies the value was computed with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Deps,
}

/// Serialize a resolved value into a data island chunk.
pub fn serialize_island<T>(
    key: &str,
    element_id: Option<&str>,
    value: &T,
    deps: &[Value],
) -> StreamResult<Chunk>
where
    T: Serialize + ?Sized,
{
    let value = to_tagged_value(value).map_err(|e| {
        StreamError::usage(format!("value for key {} is not serializable: {}", key, e))
    })?;
    let data = InitData {
        key: key.to_string(),
        value,
        element_id: element_id.map(str::to_string),
        deps: deps.to_vec(),
    };
    let json = serde_json::to_string(&data)
        .map_err(|e| StreamError::internal(format!("failed to encode data island: {}", e)))?;

    Ok(Chunk::Text(format!(
        "{}{}{}",
        island_open_tag(),
        escape_script_json(&json),
        SCRIPT_CLOSE
    )))
}

fn island_open_tag() -> String {
    format!(
        r#"<script class="{}" type="application/json">"#,
        DATA_ISLAND_CLASS
    )
}

/// Make JSON text safe to embed in a `<script>` element.
fn escape_script_json(json: &str) -> String {
    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => escaped.push_str("\\u003c"),
            '>' => escaped.push_str("\\u003e"),
            '&' => escaped.push_str("\\u0026"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Islands found in delivered markup.
#[derive(Debug, Clone, Default)]
pub struct IslandIndex {
    islands: Vec<InitData>,
}

impl IslandIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from markup.
    pub fn scan(html: &str) -> Self {
        let mut index = Self::new();
        index.extend_from(html);
        index
    }

    /// Add the islands found in more markup. Returns how many were added.
    ///
    /// Malformed payloads are logged and skipped.
    pub fn extend_from(&mut self, html: &str) -> usize {
        let open = island_open_tag();
        let before = self.islands.len();
        let mut rest = html;

        while let Some(start) = rest.find(&open) {
            let body = &rest[start + open.len()..];
            let Some(end) = body.find(SCRIPT_CLOSE) else {
                warn!(target: SUSPENSE_TARGET, "unterminated data island skipped");
                break;
            };
            match serde_json::from_str::<InitData>(&body[..end]) {
                Ok(data) => self.islands.push(data),
                Err(e) => warn!(target: SUSPENSE_TARGET, error = %e, "malformed data island skipped"),
            }
            rest = &body[end + SCRIPT_CLOSE.len()..];
        }

        self.islands.len() - before
    }

    /// Number of islands.
    pub fn len(&self) -> usize {
        self.islands.len()
    }

    /// Check if no island was found.
    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }

    /// First island for `key`.
    pub fn locate(&self, key: &str) -> Option<&InitData> {
        self.islands.iter().find(|data| data.key == key)
    }

    /// Value delivered for `key` with matching deps.
    ///
    /// A value that does not deserialize into `T` is a usage error.
    pub fn locate_value<T>(&self, key: &str, deps: &[Value]) -> StreamResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(data) = self.locate(key) else {
            return Ok(None);
        };
        if deps_changed(&data.deps, deps) {
            return Ok(None);
        }
        from_tagged_value::<T>(&data.value).map(Some).map_err(|e| {
            StreamError::usage(format!(
                "data island for key {} does not match the requested type: {}",
                key, e
            ))
        })
    }
}
