//! Render driver boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use edge_core::StreamResult;
use edge_observability::FLOW_TARGET;
use edge_streaming::{ChunkOrchestrator, Written};
use tracing::error;

use crate::context::RenderContext;

/// Callback receiving errors contained at a render boundary.
pub type BoundaryErrorHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Producer of the primary output.
///
/// The driver writes the head exactly once, then any number of renderer
/// writes. Returning `Ok` signals completion and `Err` a fatal failure; the
/// boundary translates the outcome into exactly one completion signal.
///
/// Units of work that request async values get `Suspense::Pending`; the
/// driver awaits the `Suspended` future and runs the unit again.
#[async_trait]
pub trait RenderDriver: Send + Sized + 'static {
    /// Render the document.
    async fn render(self, out: DriverOutput, cx: RenderContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> RenderDriver for F
where
    F: FnOnce(DriverOutput, RenderContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn render(self, out: DriverOutput, cx: RenderContext) -> anyhow::Result<()> {
        self(out, cx).await
    }
}

/// Errors contained at render boundaries during one pass.
#[derive(Clone, Default)]
pub(crate) struct BoundaryErrors {
    handler: Option<BoundaryErrorHandler>,
    errored: Arc<AtomicBool>,
}

impl BoundaryErrors {
    pub(crate) fn new(handler: Option<BoundaryErrorHandler>) -> Self {
        Self {
            handler,
            errored: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn report(&self, err: &anyhow::Error) {
        error!(target: FLOW_TARGET, error = %format!("{:#}", err), "boundary error");
        self.errored.store(true, Ordering::SeqCst);
        if let Some(handler) = &self.handler {
            handler(err);
        }
    }

    pub(crate) fn errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }
}

/// Write side handed to the render driver.
#[derive(Clone)]
pub struct DriverOutput {
    orchestrator: ChunkOrchestrator,
    boundary: BoundaryErrors,
}

impl DriverOutput {
    pub(crate) fn new(orchestrator: ChunkOrchestrator, boundary: BoundaryErrors) -> Self {
        Self {
            orchestrator,
            boundary,
        }
    }

    /// Write the first chunk ahead of anything injected.
    pub fn on_head_write(&self, chunk: impl Into<String>) -> StreamResult<()> {
        self.orchestrator.on_head_write(chunk)
    }

    /// Queue a subsequent chunk.
    pub fn on_renderer_write(&self, chunk: impl Into<String>) -> StreamResult<Written> {
        self.orchestrator.on_renderer_write(chunk)
    }

    /// Report an error contained by a boundary.
    ///
    /// The stream keeps going; the render is reported as not clean.
    pub fn on_boundary_error(&self, err: anyhow::Error) {
        self.boundary.report(&err);
    }

    /// Whether a boundary error was reported.
    pub fn has_errored(&self) -> bool {
        self.boundary.errored()
    }
}
