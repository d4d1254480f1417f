//! Core abstractions for streamed rendering.
//!
//! This crate provides the fundamental types shared by the platform crates:
//! - `StreamError` - Error taxonomy for stream and cache operations
//! - `StreamState` - One-way stream lifecycle
//! - `TimingContext` - Lifecycle timing marks
//! - `StreamConfig` - Tunables for orchestration and caching
//! - `RenderId` - Render pass identifier for tracing

mod config;
mod context;
mod error;
mod lifecycle;

pub use config::*;
pub use context::*;
pub use error::*;
pub use lifecycle::*;
