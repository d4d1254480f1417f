//! Error taxonomy for stream orchestration and suspense caching.

/// Result alias used across the platform crates.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced by the orchestrator, the suspense cache and the render boundary.
///
/// The type is `Clone` because one failure may be observed by several
/// waiters (every unit of work parked on the same key, every `Written`
/// handle of a discarded queue).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A caller violated a documented contract.
    #[error("usage error: {0}")]
    Usage(String),

    /// An invariant inside the orchestrator or the cache was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// A per-key resolver failed. The entry is dropped and retried on the next request.
    #[error("async value for key {key} failed: {message}")]
    TransientAsync { key: String, message: String },

    /// The render driver failed irrecoverably.
    #[error("render driver failed: {0}")]
    FatalDriver(String),

    /// The write was discarded because the stream was aborted.
    #[error("stream aborted: {0}")]
    Aborted(String),

    /// The byte destination rejected a write.
    #[error("sink error: {0}")]
    Sink(String),
}

impl StreamError {
    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a transient resolver error for a logical key.
    pub fn transient(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientAsync {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether a later request for the same key may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientAsync { .. })
    }

    /// Whether the error must reject the overall render.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::FatalDriver(_))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Sink(err.to_string())
    }
}
