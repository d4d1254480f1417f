//! Running a render driver against a sink.

use std::sync::Arc;
use std::time::Duration;

use edge_cache::SuspenseCache;
use edge_core::{RenderId, StreamConfig, StreamError, StreamResult};
use edge_observability::{RenderMetrics, FLOW_TARGET};
use edge_streaming::{
    BufferedSink, Chunk, ChunkOrchestrator, ChunkSink, CloseLease, InjectOptions, Written,
};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::context::RenderContext;
use crate::driver::{BoundaryErrorHandler, BoundaryErrors, DriverOutput, RenderDriver};
use crate::policy::{AlwaysStream, StreamingPolicy};

/// Options for one render.
#[derive(Clone)]
pub struct RenderOptions {
    /// Stream and cache tunables.
    pub config: StreamConfig,
    /// User agent of the request, handed to the streaming policy.
    pub user_agent: Option<String>,
    /// Decides whether this request is streamed.
    pub policy: Arc<dyn StreamingPolicy>,
    /// Receives errors contained at render boundaries.
    pub on_boundary_error: Option<BoundaryErrorHandler>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            config: StreamConfig::default(),
            user_agent: None,
            policy: Arc::new(AlwaysStream),
            on_boundary_error: None,
        }
    }
}

impl RenderOptions {
    /// Create options with the given config.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the request's user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the streaming policy.
    pub fn with_policy(mut self, policy: impl StreamingPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Set the boundary error callback.
    pub fn on_boundary_error(
        mut self,
        handler: impl Fn(&anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_boundary_error = Some(Arc::new(handler));
        self
    }

    fn streaming_disabled(&self) -> bool {
        self.config.disable_streaming || self.policy.disable_streaming(self.user_agent.as_deref())
    }
}

/// Render `driver` into `sink`.
///
/// When streaming, returns once the head is written or the driver finished.
/// When streaming is disabled, the sink receives the whole document as one
/// chunk and the call returns after the stream ended. A driver failing
/// before anything was written fails the call.
pub async fn render_to_stream<D, S>(
    driver: D,
    sink: S,
    options: RenderOptions,
) -> StreamResult<RenderStream>
where
    D: RenderDriver,
    S: ChunkSink + 'static,
{
    let render_id = RenderId::generate();
    let disabled = options.streaming_disabled();
    let config = options.config;

    let orchestrator = ChunkOrchestrator::with_policy(config.flush);
    if disabled {
        orchestrator.bind_sink(BufferedSink::new(sink))?;
    } else {
        orchestrator.bind_sink(sink)?;
    }

    let context = RenderContext::new(SuspenseCache::new(&config), orchestrator.clone());
    let boundary = BoundaryErrors::new(options.on_boundary_error);
    let output = DriverOutput::new(orchestrator.clone(), boundary.clone());

    info!(target: FLOW_TARGET, render_id = %render_id, streaming = !disabled, "render started");
    let task = tokio::spawn(drive(
        driver,
        output,
        context.clone(),
        orchestrator.clone(),
        config.timeout(),
    ));

    let driver = task.abort_handle();
    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    orchestrator.on_renderer_error("render driver panicked");
                }
            }
        }
    });

    let stream = RenderStream {
        render_id,
        orchestrator,
        context,
        boundary,
        disabled,
        driver,
    };

    if disabled {
        stream.orchestrator.wait_ended().await?;
    } else {
        stream.orchestrator.wait_started().await;
        if stream.orchestrator.has_ended() {
            stream.orchestrator.wait_ended().await?;
        }
        debug!(target: FLOW_TARGET, render_id = %stream.render_id, "shell ready");
    }
    Ok(stream)
}

async fn drive<D: RenderDriver>(
    driver: D,
    output: DriverOutput,
    context: RenderContext,
    orchestrator: ChunkOrchestrator,
    deadline: Option<Duration>,
) {
    let render = driver.render(output, context);
    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, render).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(target: FLOW_TARGET, timeout = ?limit, "render deadline exceeded, aborting");
                orchestrator.abort(format!("render exceeded its {:?} deadline", limit));
                return;
            }
        },
        None => render.await,
    };

    match outcome {
        Ok(()) => {
            if let Err(err) = orchestrator.on_renderer_done().await {
                debug!(target: FLOW_TARGET, error = %err, "stream ended before the renderer finished");
            }
        }
        Err(err) => orchestrator.on_renderer_error(format!("{:#}", err)),
    }
}

/// Handle on a running render.
pub struct RenderStream {
    render_id: RenderId,
    orchestrator: ChunkOrchestrator,
    context: RenderContext,
    boundary: BoundaryErrors,
    disabled: bool,
    driver: AbortHandle,
}

impl RenderStream {
    /// ID of this render.
    pub fn render_id(&self) -> &RenderId {
        &self.render_id
    }

    /// Queue an out-of-band chunk.
    ///
    /// Fails with a usage error once the stream has ended.
    pub fn inject_chunk(
        &self,
        chunk: impl Into<Chunk>,
        options: InjectOptions,
    ) -> StreamResult<Written> {
        self.orchestrator.inject_chunk(chunk, options)
    }

    /// Whether the stream has ended.
    pub fn has_stream_ended(&self) -> bool {
        self.orchestrator.has_ended()
    }

    /// Keep the stream open until the lease is released.
    pub fn do_not_close(&self) -> CloseLease {
        self.orchestrator.do_not_close()
    }

    /// Stop the driver and end the stream. Bytes already written stay.
    pub fn abort(&self, reason: impl Into<String>) {
        self.driver.abort();
        self.orchestrator.abort(reason);
    }

    /// The render's context.
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// The orchestrator behind this stream.
    pub fn orchestrator(&self) -> &ChunkOrchestrator {
        &self.orchestrator
    }

    /// Whether the render was buffered instead of streamed.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Wait for the stream to end.
    ///
    /// Resolves to `true` for a clean render and `false` if a boundary
    /// error was reported. A fatal driver failure is returned as the error.
    pub async fn stream_end(&self) -> StreamResult<bool> {
        let ended = self.orchestrator.wait_ended().await;

        let metrics = RenderMetrics::new(
            &self.render_id,
            &self.orchestrator.timing(),
            self.orchestrator.stats(),
            self.context.cache().stats(),
        )
        .with_streaming_disabled(self.disabled);
        debug!(target: FLOW_TARGET, metrics = %metrics.to_json(), "render finished");

        match ended {
            Ok(()) => Ok(!self.boundary.errored()),
            Err(err @ StreamError::FatalDriver(_)) => Err(err),
            Err(err) => {
                warn!(target: FLOW_TARGET, error = %err, "stream ended abnormally");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for RenderStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderStream")
            .field("render_id", &self.render_id)
            .field("state", &self.orchestrator.state())
            .field("disabled", &self.disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_disabled_by_config() {
        let options = RenderOptions::new(StreamConfig::default().with_streaming_disabled(true));
        assert!(options.streaming_disabled());
    }

    #[test]
    fn test_streaming_disabled_by_policy() {
        let options = RenderOptions::default()
            .with_user_agent("ExampleBot/1.0")
            .with_policy(|ua: Option<&str>| ua.is_some_and(|ua| ua.contains("Bot")));
        assert!(options.streaming_disabled());

        let options = RenderOptions::default().with_user_agent("Mozilla/5.0");
        assert!(!options.streaming_disabled());
    }
}
