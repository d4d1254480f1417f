//! Render pass identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_RENDER: AtomicU64 = AtomicU64::new(1);

/// Unique render pass identifier for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderId(String);

impl RenderId {
    /// Generate a new render ID.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = NEXT_RENDER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:x}-{:x}", nanos, seq))
    }

    /// Create from an existing ID string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = RenderId::generate();
        let b = RenderId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_string() {
        let id = RenderId::from_string("render-1");
        assert_eq!(id.as_str(), "render-1");
        assert_eq!(id.to_string(), "render-1");
    }
}
