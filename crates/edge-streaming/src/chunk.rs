//! Units of content queued for writing.

use std::fmt;
use std::future::Future;

use edge_observability::chunk_preview;
use futures::future::BoxFuture;
use futures::FutureExt;

/// A unit of content: text, or a future resolving to text.
///
/// A chunk is consumed exactly once, when the orchestrator writes it.
pub enum Chunk {
    /// Content available right away.
    Text(String),
    /// Content still being produced. Everything queued after it waits.
    Deferred(BoxFuture<'static, String>),
}

impl Chunk {
    /// Create a chunk whose content is produced by a future.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = String> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    /// Whether the content is still pending.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Short description for logs and error messages.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => chunk_preview(text),
            Self::Deferred(_) => "[deferred chunk]".to_string(),
        }
    }

    pub(crate) async fn resolve(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Deferred(future) => future.await,
        }
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}
