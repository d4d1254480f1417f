//! Explicit flush control - no implicit buffering.

pub use edge_core::FlushPolicy;

/// Options for an injected chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectOptions {
    /// Ask the sink to flush right after this chunk is written.
    pub flush: bool,
}

impl InjectOptions {
    /// Options requesting a flush after the write.
    pub fn with_flush() -> Self {
        Self { flush: true }
    }
}
