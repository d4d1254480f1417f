//! Public SDK for streamed rendering.
//!
//! This crate connects a render driver to the chunk orchestrator and the
//! suspense cache, and re-exports the platform crates:
//!
//! ```ignore
//! use edge_sdk::prelude::*;
//!
//! struct Page;
//!
//! #[async_trait::async_trait]
//! impl RenderDriver for Page {
//!     async fn render(self, out: DriverOutput, cx: RenderContext) -> anyhow::Result<()> {
//!         out.on_head_write("<html><body>")?;
//!         let user = loop {
//!             match cx.use_async("user", "r1", || async { Ok(load_user().await?) }) {
//!                 Suspense::Done(user) => break user,
//!                 Suspense::Pending(suspended) => suspended.await,
//!                 Suspense::Error(err) => return Err(err.into()),
//!             }
//!         };
//!         out.on_renderer_write(render_user(&user))?;
//!         out.on_renderer_write("</body></html>")?;
//!         Ok(())
//!     }
//! }
//!
//! let stream = render_to_stream(Page, sink, RenderOptions::default()).await?;
//! stream.inject_chunk("<script>analytics()</script>", InjectOptions::default())?;
//! let clean = stream.stream_end().await?;
//! ```

mod context;
mod driver;
mod policy;
mod render;

pub use context::*;
pub use driver::*;
pub use policy::*;
pub use render::*;

pub use edge_cache;
pub use edge_core;
pub use edge_observability;
pub use edge_streaming;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        render_to_stream, AlwaysStream, BoundaryErrorHandler, DriverOutput, HydrationContext,
        RenderContext, RenderDriver, RenderOptions, RenderStream, StreamingPolicy,
    };
    pub use edge_cache::*;
    pub use edge_core::*;
    pub use edge_observability::*;
    pub use edge_streaming::*;
}
