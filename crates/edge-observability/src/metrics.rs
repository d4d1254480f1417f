//! Per-render metrics.

use edge_core::{RenderId, TimingContext};
use serde::{Deserialize, Serialize};

/// Write counters kept by the chunk orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Chunks that reached the sink, head write included.
    pub chunks_written: u64,
    /// Bytes that reached the sink.
    pub bytes_written: u64,
    /// Chunks accepted from out-of-band producers.
    pub injected_chunks: u64,
    /// Explicit sink flushes.
    pub flushes: u64,
    /// Queued writes dropped by an abort or a fatal driver error.
    pub discarded_chunks: u64,
}

impl StreamStats {
    /// Record a write of `bytes` bytes.
    pub fn record_write(&mut self, bytes: usize) {
        self.chunks_written += 1;
        self.bytes_written += bytes as u64;
    }
}

/// Counters kept by the suspense cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspenseStats {
    /// Requests answered from an existing entry or a hydrated value.
    pub hits: u64,
    /// Requests that had to invoke the resolver.
    pub misses: u64,
    /// Requests answered from the unstable-identity side table.
    pub reused: u64,
    /// Requests that returned a pending suspension.
    pub suspensions: u64,
    /// Resolver failures handed back to callers.
    pub errors: u64,
}

/// Summary of one render pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderMetrics {
    /// Render ID for correlation.
    pub render_id: String,
    /// Time to the head write (microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_head_us: Option<u64>,
    /// Time until the stream ended (microseconds).
    pub total_duration_us: u64,
    /// Whether streaming was disabled for this render.
    pub streaming_disabled: bool,
    /// Write counters.
    pub stream: StreamStats,
    /// Cache counters.
    pub suspense: SuspenseStats,
}

impl RenderMetrics {
    /// Assemble the record from the collected parts.
    pub fn new(
        render_id: &RenderId,
        timing: &TimingContext,
        stream: StreamStats,
        suspense: SuspenseStats,
    ) -> Self {
        Self {
            render_id: render_id.to_string(),
            time_to_head_us: timing.time_to_head().map(|d| d.as_micros() as u64),
            total_duration_us: timing.total_time().as_micros() as u64,
            streaming_disabled: false,
            stream,
            suspense,
        }
    }

    /// Flag the render as non-streamed.
    pub fn with_streaming_disabled(mut self, disabled: bool) -> Self {
        self.streaming_disabled = disabled;
        self
    }

    /// Format as JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
