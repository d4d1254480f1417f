//! Suspense cache and hydration bridge for streamed renders.
//!
//! This crate provides:
//! - `SuspenseKey` - Composite `(logical, instance)` key with canonical stringify
//! - `SuspenseCache` - Per-render-pass table of async computations with suspend/resume
//! - `WorkaroundCache` - Time-boxed reuse of values across unstable instance ids
//! - `LoopGuard` - Detection of drivers retrying suspended work in a tight loop
//! - `serialize_island` / `IslandIndex` - Data islands carrying resolved values to the client
//!
//! # Example
//!
//! ```ignore
//! use edge_cache::{Suspense, SuspenseCache, SuspenseKey};
//! use edge_core::StreamConfig;
//!
//! let cache = SuspenseCache::new(&StreamConfig::default());
//! let key = SuspenseKey::from_key(&("user", 42), "r1")?;
//!
//! match cache.request::<String>(&key).resolve(|| async { Ok(load_user(42).await?) }) {
//!     Suspense::Done(name) => render(name),
//!     Suspense::Pending(suspended) => suspended.await, // retry afterwards
//!     Suspense::Error(err) => fallback(err),
//! }
//! ```

mod guard;
mod hydration;
mod key;
mod suspense;
mod tagged;
mod workaround;

pub use guard::*;
pub use hydration::*;
pub use key::*;
pub use suspense::*;
pub use workaround::*;
