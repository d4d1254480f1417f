//! Ordered chunk streaming with out-of-band injection.
//!
//! This crate merges the render driver's writes and injected chunks into
//! one ordered stream:
//! - `ChunkOrchestrator` - Head-first, FIFO write ordering with deferred close
//! - `Chunk` - Text or deferred text queued for writing
//! - `ChunkSink` - Byte destination with optional flush capability
//! - `CloseLease` - Holds the stream open until released
//! - `InjectOptions` / `FlushPolicy` - Explicit flush control

mod chunk;
mod flush;
mod lease;
mod orchestrator;
mod sink;

pub use chunk::*;
pub use flush::*;
pub use lease::*;
pub use orchestrator::*;
pub use sink::*;
