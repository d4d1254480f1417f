//! Stream and cache configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// When the orchestrator asks the sink to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushPolicy {
    /// Flush after every renderer write and after injected chunks that ask for it.
    #[default]
    RendererWrites,
    /// Flush only after injected chunks that ask for it.
    OnRequest,
    /// Never flush explicitly.
    Never,
}

impl FlushPolicy {
    /// Check if a renderer write should be flushed.
    pub fn flush_renderer_write(&self) -> bool {
        matches!(self, Self::RendererWrites)
    }

    /// Check if an injected chunk with the given hint should be flushed.
    pub fn flush_injected(&self, requested: bool) -> bool {
        requested && !matches!(self, Self::Never)
    }
}

/// Detection of drivers that retry suspended work in a tight loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGuardConfig {
    /// Window in which pending dispatches for one key are counted.
    pub window_ms: u64,
    /// Pending dispatches tolerated per key inside one window.
    pub max_pending_requests: u32,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_pending_requests: 100,
        }
    }
}

impl LoopGuardConfig {
    /// Get the counting window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Tunables for one render pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a resolved value stays reusable for requests whose
    /// instance id changed between passes.
    pub workaround_grace_ms: u64,

    /// Infinite-suspension guard.
    pub loop_guard: LoopGuardConfig,

    /// Render deadline. `None` disables the deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Flush behavior.
    pub flush: FlushPolicy,

    /// Buffer the whole render instead of streaming it.
    pub disable_streaming: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            workaround_grace_ms: 1000,
            loop_guard: LoopGuardConfig::default(),
            timeout_ms: Some(20_000),
            flush: FlushPolicy::default(),
            disable_streaming: false,
        }
    }
}

impl StreamConfig {
    /// Load config from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        } else {
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Set the grace window.
    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.workaround_grace_ms = window.as_millis() as u64;
        self
    }

    /// Set or clear the render deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Set the flush policy.
    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    /// Disable or enable streaming.
    pub fn with_streaming_disabled(mut self, disabled: bool) -> Self {
        self.disable_streaming = disabled;
        self
    }

    /// Get the grace window.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.workaround_grace_ms)
    }

    /// Get the render deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();

        assert_eq!(config.grace_window(), Duration::from_secs(1));
        assert_eq!(config.timeout(), Some(Duration::from_secs(20)));
        assert_eq!(config.flush, FlushPolicy::RendererWrites);
        assert_eq!(config.loop_guard.max_pending_requests, 100);
        assert!(!config.disable_streaming);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StreamConfig::from_toml_str(
            r#"
            workaround_grace_ms = 250
            flush = "on-request"

            [loop_guard]
            max_pending_requests = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.grace_window(), Duration::from_millis(250));
        assert_eq!(config.flush, FlushPolicy::OnRequest);
        assert_eq!(config.loop_guard.max_pending_requests, 5);
        assert_eq!(config.loop_guard.window_ms, 1000);
        assert_eq!(config.timeout_ms, Some(20_000));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        std::fs::write(&path, r#"{"disable_streaming": true, "timeout_ms": 500}"#).unwrap();

        let config = StreamConfig::load(&path).unwrap();
        assert!(config.disable_streaming);
        assert_eq!(config.timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = StreamConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_flush_policy() {
        assert!(FlushPolicy::RendererWrites.flush_renderer_write());
        assert!(!FlushPolicy::OnRequest.flush_renderer_write());
        assert!(FlushPolicy::OnRequest.flush_injected(true));
        assert!(!FlushPolicy::OnRequest.flush_injected(false));
        assert!(!FlushPolicy::Never.flush_injected(true));
    }

    #[test]
    fn test_builder_chain() {
        let config = StreamConfig::default()
            .with_grace_window(Duration::from_millis(10))
            .with_timeout(None)
            .with_flush(FlushPolicy::Never)
            .with_streaming_disabled(true);

        assert_eq!(config.workaround_grace_ms, 10);
        assert!(config.timeout().is_none());
        assert_eq!(config.flush, FlushPolicy::Never);
        assert!(config.disable_streaming);
    }
}
