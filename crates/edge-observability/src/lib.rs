//! Observability infrastructure for streamed rendering.
//!
//! This crate provides:
//! - Log targets and `init_logging` - `tracing` setup with per-concern targets
//! - `StreamStats` / `SuspenseStats` - Counters kept by the orchestrator and the cache
//! - `RenderMetrics` - Per-render summary record

mod logging;
mod metrics;

pub use logging::*;
pub use metrics::*;

// Re-export RenderId and TimingContext from edge-core for convenience
pub use edge_core::{RenderId, TimingContext};
