//! Structured logging setup.
//!
//! Every crate logs through `tracing` with one of the targets below so a
//! single concern can be switched on, e.g. `EDGE_LOG=edge_streaming::chunks=trace`.

use tracing_subscriber::EnvFilter;

/// Write queue traffic: injections, writes, flushes, start and end.
pub const CHUNKS_TARGET: &str = "edge_streaming::chunks";

/// Render lifecycle: driver start, head ready, completion, errors.
pub const FLOW_TARGET: &str = "edge_streaming::flow";

/// Suspense cache decisions.
pub const SUSPENSE_TARGET: &str = "edge_cache::suspense";

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "EDGE_LOG";

const PREVIEW_LIMIT: usize = 160;

/// Output format for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format (for production/log aggregation).
    #[default]
    Json,
    /// Human-readable format (for development).
    Human,
}

/// Error returned when a global subscriber is already installed.
#[derive(Debug, thiserror::Error)]
#[error("a global tracing subscriber is already installed")]
pub struct LoggingAlreadyInitialized;

/// Install the global subscriber.
///
/// Filter directives come from `EDGE_LOG` and default to `warn`.
pub fn init_logging(format: LogFormat) -> Result<(), LoggingAlreadyInitialized> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Human => builder.try_init(),
    };
    result.map_err(|_| LoggingAlreadyInitialized)
}

/// Shorten chunk content for log lines and error messages.
pub fn chunk_preview(chunk: &str) -> String {
    if chunk.chars().count() <= PREVIEW_LIMIT {
        return chunk.to_string();
    }
    let head: String = chunk.chars().take(PREVIEW_LIMIT).collect();
    format!("{}... ({} bytes)", head, chunk.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_preview_is_verbatim() {
        assert_eq!(chunk_preview("<div>hi</div>"), "<div>hi</div>");
    }

    #[test]
    fn test_long_preview_is_truncated() {
        let chunk = "x".repeat(500);
        let preview = chunk_preview(&chunk);

        assert!(preview.starts_with(&"x".repeat(PREVIEW_LIMIT)));
        assert!(preview.ends_with("... (500 bytes)"));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let chunk = "é".repeat(200);
        let preview = chunk_preview(&chunk);
        assert!(preview.contains("(400 bytes)"));
    }

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_logging(LogFormat::Human);
        let err = init_logging(LogFormat::Json).unwrap_err();
        assert_eq!(
            err.to_string(),
            "a global tracing subscriber is already installed"
        );
        let _: &dyn std::error::Error = &err;
    }
}
