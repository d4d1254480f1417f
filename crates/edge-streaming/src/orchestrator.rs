//! Chunk write orchestration.
//!
//! One output stream has two producers: the render driver and out-of-band
//! injections. The orchestrator enforces:
//! 1. The head write is the first thing the sink receives
//! 2. Queued writes reach the sink in call order, deferred chunks included
//! 3. The stream ends only once the driver is done, the queue is drained
//!    and no close lease is outstanding
//!
//! Queued writes are drained by a single writer task, so a deferred chunk
//! holds back everything queued after it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use edge_core::{FlushPolicy, StreamError, StreamResult, StreamState, TimingContext};
use edge_observability::{chunk_preview, StreamStats, CHUNKS_TARGET, FLOW_TARGET};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};

use crate::chunk::Chunk;
use crate::flush::InjectOptions;
use crate::lease::CloseLease;
use crate::sink::ChunkSink;

enum WriteOp {
    Write {
        chunk: Chunk,
        flush: bool,
        done: oneshot::Sender<StreamResult<()>>,
    },
    Close,
}

struct Inner {
    state: StreamState,
    sink: Option<Box<dyn ChunkSink>>,
    /// Writes accepted but not yet completed or discarded.
    queued: usize,
    /// Outstanding close leases.
    leases: usize,
    aborted: Option<String>,
    failure: Option<StreamError>,
    timing: TimingContext,
    stats: StreamStats,
}

impl Inner {
    fn transition(&mut self, next: StreamState) -> StreamResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StreamError::internal(format!(
                "illegal stream transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn write_now(&mut self, chunk: &str, flush: bool) -> StreamResult<()> {
        if self.state.has_ended() {
            return Err(StreamError::internal("write attempted after the stream ended"));
        }
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| StreamError::internal("write attempted before a sink was bound"))?;

        sink.write_chunk(chunk)?;
        trace!(target: CHUNKS_TARGET, chunk = %chunk_preview(chunk), ">>> WRITE");

        let flushed = flush && sink.can_flush();
        if flushed {
            sink.flush()?;
            trace!(target: CHUNKS_TARGET, ">>> FLUSH");
        }

        self.stats.record_write(chunk.len());
        if flushed {
            self.stats.flushes += 1;
        }
        Ok(())
    }
}

struct Shared {
    inner: Mutex<Inner>,
    queue: mpsc::UnboundedSender<WriteOp>,
    /// Bumped on every change waiters may care about.
    progress: watch::Sender<u64>,
    /// Opened once queued writes may reach the sink.
    head_gate: watch::Sender<bool>,
    /// Set when queued writes must be dropped instead of written.
    discard: watch::Sender<bool>,
    policy: FlushPolicy,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.progress.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn open_gate(&self) {
        self.head_gate.send_replace(true);
    }

    fn enqueue(&self, inner: &mut Inner, chunk: Chunk, flush: bool) -> StreamResult<Written> {
        let (done, receipt) = oneshot::channel();
        self.queue
            .send(WriteOp::Write { chunk, flush, done })
            .map_err(|_| StreamError::internal("write queue is closed"))?;
        inner.queued += 1;
        Ok(Written::pending(receipt))
    }

    /// Finish one queued write. `None` means the chunk was discarded.
    fn complete_queued(&self, text: Option<String>, flush: bool) -> StreamResult<()> {
        let mut inner = self.lock();
        inner.queued = inner.queued.saturating_sub(1);

        let result = match (text, inner.aborted.clone()) {
            (Some(text), None) => inner.write_now(&text, flush),
            (_, reason) => {
                inner.stats.discarded_chunks += 1;
                let reason = reason.unwrap_or_else(|| "orchestrator dropped".to_string());
                trace!(target: CHUNKS_TARGET, reason = %reason, "queued chunk discarded");
                Err(StreamError::Aborted(reason))
            }
        };
        if let Err(err) = &result {
            if !matches!(err, StreamError::Aborted(_)) {
                warn!(target: CHUNKS_TARGET, error = %err, "queued write failed");
            }
        }

        drop(inner);
        self.bump();
        result
    }

    fn release_lease(&self) {
        let mut inner = self.lock();
        inner.leases = inner.leases.saturating_sub(1);
        trace!(target: CHUNKS_TARGET, leases = inner.leases, "close lease released");
        drop(inner);
        self.bump();
    }

    fn finish(&self, inner: &mut Inner) {
        if let Err(err) = inner.transition(StreamState::Ended) {
            warn!(target: CHUNKS_TARGET, error = %err, "stream end skipped");
            return;
        }
        inner.timing.mark(TimingContext::ENDED);
        if let Some(sink) = inner.sink.as_mut() {
            if let Err(err) = sink.end() {
                warn!(target: CHUNKS_TARGET, error = %err, "sink failed to end");
            }
        }
        let _ = self.queue.send(WriteOp::Close);
        debug!(target: CHUNKS_TARGET, ">>> END");
    }

    fn terminate(&self, reason: String, failure: Option<StreamError>) {
        let mut inner = self.lock();
        if inner.state.has_ended() {
            return;
        }
        inner.aborted = Some(reason);
        inner.failure = failure;
        self.discard.send_replace(true);
        self.finish(&mut inner);
        drop(inner);

        self.open_gate();
        self.bump();
    }
}

async fn run_writer(
    shared: Weak<Shared>,
    mut queue: mpsc::UnboundedReceiver<WriteOp>,
    mut head_gate: watch::Receiver<bool>,
    mut discard: watch::Receiver<bool>,
) {
    if head_gate.wait_for(|open| *open).await.is_err() {
        return;
    }

    while let Some(op) = queue.recv().await {
        let (chunk, flush, done) = match op {
            WriteOp::Write { chunk, flush, done } => (chunk, flush, done),
            WriteOp::Close => break,
        };

        let discarding = *discard.borrow();
        let text = if discarding {
            None
        } else {
            tokio::select! {
                text = chunk.resolve() => Some(text),
                _ = discard.wait_for(|d| *d) => None,
            }
        };

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let _ = done.send(shared.complete_queued(text, flush));
    }
}

/// Completion of a queued write.
///
/// Resolves once the chunk reached the sink, or with the error that kept it
/// from doing so. Dropping it does not cancel the write.
#[derive(Debug)]
pub struct Written {
    receipt: Option<oneshot::Receiver<StreamResult<()>>>,
}

impl Written {
    fn ready() -> Self {
        Self { receipt: None }
    }

    fn pending(receipt: oneshot::Receiver<StreamResult<()>>) -> Self {
        Self {
            receipt: Some(receipt),
        }
    }
}

impl Future for Written {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.receipt.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(receipt) => Pin::new(receipt).poll(cx).map(|result| {
                result.unwrap_or_else(|_| Err(StreamError::internal("write queue dropped the chunk")))
            }),
        }
    }
}

/// Single point through which every chunk reaches the sink.
///
/// Cheap to clone; clones share the same stream.
#[derive(Clone)]
pub struct ChunkOrchestrator {
    shared: Arc<Shared>,
}

impl ChunkOrchestrator {
    /// Create an orchestrator with the default flush policy.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_policy(FlushPolicy::default())
    }

    /// Create an orchestrator with an explicit flush policy.
    pub fn with_policy(policy: FlushPolicy) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (head_gate, gate_rx) = watch::channel(false);
        let (discard, discard_rx) = watch::channel(false);
        let (progress, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: StreamState::Unstarted,
                sink: None,
                queued: 0,
                leases: 0,
                aborted: None,
                failure: None,
                timing: TimingContext::new(),
                stats: StreamStats::default(),
            }),
            queue,
            progress,
            head_gate,
            discard,
            policy,
        });

        tokio::spawn(run_writer(
            Arc::downgrade(&shared),
            queue_rx,
            gate_rx,
            discard_rx,
        ));
        Self { shared }
    }

    /// Create an orchestrator already bound to a sink.
    pub fn with_sink(sink: impl ChunkSink + 'static, policy: FlushPolicy) -> Self {
        let orchestrator = Self::with_policy(policy);
        orchestrator.shared.lock().sink = Some(Box::new(sink));
        orchestrator
    }

    /// Bind the byte destination. A sink can be bound once.
    pub fn bind_sink(&self, sink: impl ChunkSink + 'static) -> StreamResult<()> {
        let mut inner = self.shared.lock();
        if inner.sink.is_some() {
            return Err(StreamError::usage("a sink is already bound to this stream"));
        }
        inner.sink = Some(Box::new(sink));
        Ok(())
    }

    /// The flush policy in effect.
    pub fn policy(&self) -> FlushPolicy {
        self.shared.policy
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    /// Whether the stream has ended.
    pub fn has_ended(&self) -> bool {
        self.state().has_ended()
    }

    /// Snapshot of the write counters.
    pub fn stats(&self) -> StreamStats {
        self.shared.lock().stats
    }

    /// Snapshot of the timing marks.
    pub fn timing(&self) -> TimingContext {
        self.shared.lock().timing.clone()
    }

    /// Write the renderer's first chunk directly to the sink.
    ///
    /// Starts the stream and releases every chunk queued so far.
    pub fn on_head_write(&self, chunk: impl Into<String>) -> StreamResult<()> {
        let chunk = chunk.into();
        let mut inner = self.shared.lock();
        if !inner.state.can_transition_to(StreamState::Streaming) {
            return Err(StreamError::internal(format!(
                "head write received while the stream is {}",
                inner.state
            )));
        }

        debug!(target: CHUNKS_TARGET, ">>> START");
        inner.write_now(&chunk, self.shared.policy.flush_renderer_write())?;
        inner.transition(StreamState::Streaming)?;
        inner.timing.mark(TimingContext::HEAD_WRITTEN);
        drop(inner);

        self.shared.open_gate();
        self.shared.bump();
        Ok(())
    }

    /// Queue a renderer write behind everything already queued.
    ///
    /// A write arriving before the head is treated as the head.
    pub fn on_renderer_write(&self, chunk: impl Into<String>) -> StreamResult<Written> {
        let chunk = chunk.into();
        let mut inner = self.shared.lock();
        let state = inner.state;
        match state {
            StreamState::Unstarted => {
                drop(inner);
                self.on_head_write(chunk)?;
                Ok(Written::ready())
            }
            StreamState::Ended => Err(StreamError::internal(
                "renderer wrote after the stream ended",
            )),
            StreamState::Streaming => {
                let flush = self.shared.policy.flush_renderer_write();
                self.shared.enqueue(&mut inner, Chunk::Text(chunk), flush)
            }
        }
    }

    /// Queue an out-of-band chunk.
    ///
    /// Fails with a usage error once the stream has ended. Chunks injected
    /// before the head write are held until it happens.
    pub fn inject_chunk(
        &self,
        chunk: impl Into<Chunk>,
        options: InjectOptions,
    ) -> StreamResult<Written> {
        let chunk = chunk.into();
        let mut inner = self.shared.lock();
        if inner.state.has_ended() {
            return Err(StreamError::usage(format!(
                "Cannot inject the following chunk because the stream has already ended. \
                 Consider using do_not_close() and has_stream_ended(). The chunk:\n{}",
                chunk.preview()
            )));
        }

        trace!(target: CHUNKS_TARGET, chunk = %chunk.preview(), "inject_chunk()");
        inner.stats.injected_chunks += 1;
        let flush = self.shared.policy.flush_injected(options.flush);
        self.shared.enqueue(&mut inner, chunk, flush)
    }

    /// Take a lease that keeps the stream open until released.
    pub fn do_not_close(&self) -> CloseLease {
        let mut inner = self.shared.lock();
        inner.leases += 1;
        trace!(target: CHUNKS_TARGET, leases = inner.leases, "close lease taken");
        drop(inner);

        let shared = Arc::downgrade(&self.shared);
        CloseLease::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.release_lease();
            }
        })
    }

    /// The render driver finished writing.
    ///
    /// Waits for queued writes and close leases, then ends the stream.
    pub async fn on_renderer_done(&self) -> StreamResult<()> {
        debug!(target: FLOW_TARGET, "renderer done");
        // The renderer may have produced no output at all.
        self.shared.open_gate();
        // Producers reacting to the finished render get a turn to take a lease.
        tokio::task::yield_now().await;

        let mut progress = self.shared.progress.subscribe();
        loop {
            {
                let mut inner = self.shared.lock();
                if inner.state.has_ended() {
                    return inner.failure.clone().map_or(Ok(()), Err);
                }
                if inner.queued == 0 && inner.leases == 0 {
                    self.shared.finish(&mut inner);
                    break;
                }
                trace!(
                    target: CHUNKS_TARGET,
                    queued = inner.queued,
                    leases = inner.leases,
                    "waiting before closing"
                );
            }
            if progress.changed().await.is_err() {
                return Err(StreamError::internal("progress channel closed"));
            }
        }

        self.shared.bump();
        Ok(())
    }

    /// The render driver failed irrecoverably. Queued writes are discarded.
    pub fn on_renderer_error(&self, err: impl fmt::Display) {
        let message = err.to_string();
        error!(target: FLOW_TARGET, error = %message, "render driver failed");
        self.shared
            .terminate(message.clone(), Some(StreamError::FatalDriver(message)));
    }

    /// End the stream now, discarding queued writes.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(target: FLOW_TARGET, reason = %reason, "stream aborted");
        self.shared.terminate(reason, None);
    }

    /// Wait until the head has been written or the stream ended.
    pub async fn wait_started(&self) {
        let mut progress = self.shared.progress.subscribe();
        loop {
            let state = self.state();
            if state.has_started() {
                return;
            }
            if progress.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the stream has ended. Fails if the driver failed.
    pub async fn wait_ended(&self) -> StreamResult<()> {
        let mut progress = self.shared.progress.subscribe();
        loop {
            {
                let inner = self.shared.lock();
                if inner.state.has_ended() {
                    return inner.failure.clone().map_or(Ok(()), Err);
                }
            }
            if progress.changed().await.is_err() {
                return Err(StreamError::internal("progress channel closed"));
            }
        }
    }
}

impl Default for ChunkOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ChunkOrchestrator")
            .field("state", &inner.state)
            .field("queued", &inner.queued)
            .field("leases", &inner.leases)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;

    fn setup(policy: FlushPolicy) -> (ChunkOrchestrator, BufferSink) {
        let sink = BufferSink::flushable();
        let orchestrator = ChunkOrchestrator::with_sink(sink.clone(), policy);
        (orchestrator, sink)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_injection_between_renderer_writes() {
        let (orchestrator, sink) = setup(FlushPolicy::default());

        orchestrator.on_head_write("A").unwrap();
        let x = orchestrator
            .inject_chunk("X", InjectOptions::default())
            .unwrap();
        let b = orchestrator.on_renderer_write("B").unwrap();
        x.await.unwrap();
        b.await.unwrap();
        orchestrator.on_renderer_done().await.unwrap();

        assert_eq!(sink.contents(), "AXB");
        assert!(sink.is_ended());
        assert!(orchestrator.has_ended());
    }

    #[tokio::test]
    async fn test_injection_before_head_waits() {
        let (orchestrator, sink) = setup(FlushPolicy::default());

        let x = orchestrator
            .inject_chunk("X", InjectOptions::default())
            .unwrap();
        settle().await;
        assert_eq!(sink.contents(), "");

        orchestrator.on_head_write("A").unwrap();
        x.await.unwrap();
        orchestrator.on_renderer_done().await.unwrap();

        assert_eq!(sink.writes(), vec!["A", "X"]);
    }

    #[tokio::test]
    async fn test_deferred_chunk_holds_back_later_writes() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        let (tx, rx) = oneshot::channel::<String>();

        orchestrator.on_head_write("A").unwrap();
        let x = orchestrator
            .inject_chunk(
                Chunk::deferred(async move { rx.await.unwrap_or_default() }),
                InjectOptions::default(),
            )
            .unwrap();
        let b = orchestrator.on_renderer_write("B").unwrap();
        settle().await;
        assert_eq!(sink.contents(), "A");

        tx.send("X".to_string()).unwrap();
        x.await.unwrap();
        b.await.unwrap();
        assert_eq!(sink.contents(), "AXB");
    }

    #[tokio::test]
    async fn test_inject_after_end_is_usage_error() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();
        orchestrator.on_renderer_done().await.unwrap();

        let err = orchestrator
            .inject_chunk("<script>late()</script>", InjectOptions::default())
            .unwrap_err();
        assert!(matches!(err, StreamError::Usage(_)));
        let message = err.to_string();
        assert!(message.contains("stream has already ended"));
        assert!(message.contains("<script>late()</script>"));
    }

    #[tokio::test]
    async fn test_close_lease_defers_end() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();
        let lease = orchestrator.do_not_close();

        let done = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.on_renderer_done().await }
        });
        settle().await;
        assert!(!orchestrator.has_ended());

        orchestrator
            .inject_chunk("late", InjectOptions::default())
            .unwrap()
            .await
            .unwrap();
        settle().await;
        assert!(!orchestrator.has_ended());

        lease.release();
        done.await.unwrap().unwrap();
        assert!(orchestrator.has_ended());
        assert_eq!(sink.contents(), "Alate");
    }

    #[tokio::test]
    async fn test_done_without_output_ends_immediately() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        orchestrator.on_renderer_done().await.unwrap();

        assert!(orchestrator.has_ended());
        assert_eq!(sink.contents(), "");
        assert!(sink.is_ended());
    }

    #[tokio::test]
    async fn test_abort_discards_queued_writes() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();

        let stuck = orchestrator
            .inject_chunk(
                Chunk::deferred(futures::future::pending()),
                InjectOptions::default(),
            )
            .unwrap();
        let after = orchestrator
            .inject_chunk("Y", InjectOptions::default())
            .unwrap();
        settle().await;

        orchestrator.abort("client disconnected");

        assert!(matches!(stuck.await, Err(StreamError::Aborted(_))));
        assert!(matches!(after.await, Err(StreamError::Aborted(_))));
        assert_eq!(sink.contents(), "A");
        assert!(orchestrator.has_ended());
        assert_eq!(orchestrator.stats().discarded_chunks, 2);
    }

    #[tokio::test]
    async fn test_renderer_error_fails_wait_ended() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();
        orchestrator.on_renderer_error("boom");

        let err = orchestrator.wait_ended().await.unwrap_err();
        assert_eq!(err, StreamError::FatalDriver("boom".to_string()));
    }

    #[tokio::test]
    async fn test_head_write_without_sink_is_internal_error() {
        let orchestrator = ChunkOrchestrator::new();
        let err = orchestrator.on_head_write("A").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(orchestrator.state(), StreamState::Unstarted);
    }

    #[tokio::test]
    async fn test_second_head_write_is_internal_error() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();
        assert!(matches!(
            orchestrator.on_head_write("B"),
            Err(StreamError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_head_write_after_abort_is_internal_error() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        orchestrator.abort("client went away");

        let err = orchestrator.on_head_write("A").unwrap_err();
        assert!(matches!(err, StreamError::Internal(ref m) if m.contains("ENDED")));
        assert_eq!(orchestrator.state(), StreamState::Ended);
        assert_eq!(sink.contents(), "");
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state_alone() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("A").unwrap();

        let mut inner = orchestrator.shared.lock();
        assert!(inner.transition(StreamState::Streaming).is_err());
        assert!(inner.transition(StreamState::Unstarted).is_err());
        assert_eq!(inner.state, StreamState::Streaming);
        assert!(inner.transition(StreamState::Ended).is_ok());
    }

    #[tokio::test]
    async fn test_first_renderer_write_is_the_head() {
        let (orchestrator, sink) = setup(FlushPolicy::default());
        orchestrator.on_renderer_write("A").unwrap().await.unwrap();

        assert_eq!(orchestrator.state(), StreamState::Streaming);
        assert_eq!(sink.contents(), "A");
        assert!(orchestrator.timing().time_to_head().is_some());
    }

    #[tokio::test]
    async fn test_bind_sink_twice_is_usage_error() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        assert!(matches!(
            orchestrator.bind_sink(BufferSink::new()),
            Err(StreamError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_follows_policy() {
        let (orchestrator, sink) = setup(FlushPolicy::RendererWrites);
        orchestrator.on_head_write("A").unwrap();
        orchestrator.on_renderer_write("B").unwrap().await.unwrap();
        orchestrator
            .inject_chunk("X", InjectOptions::default())
            .unwrap()
            .await
            .unwrap();
        orchestrator
            .inject_chunk("Y", InjectOptions::with_flush())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(sink.flush_count(), 3);

        let (orchestrator, sink) = setup(FlushPolicy::Never);
        orchestrator.on_head_write("A").unwrap();
        orchestrator
            .inject_chunk("Y", InjectOptions::with_flush())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(sink.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_stats_count_writes() {
        let (orchestrator, _sink) = setup(FlushPolicy::default());
        orchestrator.on_head_write("AB").unwrap();
        orchestrator
            .inject_chunk("XYZ", InjectOptions::default())
            .unwrap()
            .await
            .unwrap();
        orchestrator.on_renderer_done().await.unwrap();

        let stats = orchestrator.stats();
        assert_eq!(stats.chunks_written, 2);
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.injected_chunks, 1);
    }
}
