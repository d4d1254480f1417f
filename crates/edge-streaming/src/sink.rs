//! Byte destinations for the orchestrated stream.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc;

/// Ordered, append-only destination with an optional flush capability.
///
/// The orchestrator is the only writer; it never calls a sink concurrently.
pub trait ChunkSink: Send {
    /// Append a chunk.
    fn write_chunk(&mut self, chunk: &str) -> io::Result<()>;

    /// Whether `flush` does anything for this transport.
    fn can_flush(&self) -> bool {
        false
    }

    /// Push buffered bytes to the client.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the stream ends.
    fn end(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BufferState {
    content: String,
    writes: Vec<String>,
    flushes: usize,
    ended: bool,
}

/// In-memory sink. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    state: Arc<Mutex<BufferState>>,
    flushable: bool,
}

impl BufferSink {
    /// Create a buffer without flush capability.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer that reports flush capability and counts flushes.
    pub fn flushable() -> Self {
        Self {
            flushable: true,
            ..Self::default()
        }
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        self.lock().content.clone()
    }

    /// Individual writes, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Number of flushes performed.
    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    /// Whether `end` was called.
    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkSink for BufferSink {
    fn write_chunk(&mut self, chunk: &str) -> io::Result<()> {
        let mut state = self.lock();
        state.content.push_str(chunk);
        state.writes.push(chunk.to_string());
        Ok(())
    }

    fn can_flush(&self) -> bool {
        self.flushable
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn end(&mut self) -> io::Result<()> {
        self.lock().ended = true;
        Ok(())
    }
}

/// Sink over any `std::io::Write`. Always flush-capable.
#[derive(Debug)]
pub struct WriterSink<W> {
    inner: W,
}

impl<W: Write + Send> WriterSink<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the sink and return the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> ChunkSink for WriterSink<W> {
    fn write_chunk(&mut self, chunk: &str) -> io::Result<()> {
        self.inner.write_all(chunk.as_bytes())
    }

    fn can_flush(&self) -> bool {
        true
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn end(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Receiving half of a `ChannelSink`, usable as a response body stream.
pub type ChunkReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Sink forwarding bytes to a channel; the receiver ends when the stream ends.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    /// Create the sink and the byte stream it feeds.
    pub fn new() -> (Self, ChunkReceiver) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }
}

impl ChunkSink for ChannelSink {
    fn write_chunk(&mut self, chunk: &str) -> io::Result<()> {
        self.tx
            .unbounded_send(chunk.as_bytes().to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream receiver dropped"))
    }

    fn end(&mut self) -> io::Result<()> {
        self.tx.close_channel();
        Ok(())
    }
}

/// Holds every chunk until the stream ends, then writes them as one chunk.
///
/// Used when streaming is disabled: the client receives the complete
/// document at once.
#[derive(Debug)]
pub struct BufferedSink<S> {
    inner: S,
    pending: String,
}

impl<S: ChunkSink> BufferedSink<S> {
    /// Wrap a sink.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: String::new(),
        }
    }
}

impl<S: ChunkSink> ChunkSink for BufferedSink<S> {
    fn write_chunk(&mut self, chunk: &str) -> io::Result<()> {
        self.pending.push_str(chunk);
        Ok(())
    }

    fn end(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let document = std::mem::take(&mut self.pending);
            self.inner.write_chunk(&document)?;
        }
        self.inner.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_buffer_sink_shares_state() {
        let sink = BufferSink::new();
        let mut writer = sink.clone();

        writer.write_chunk("<h1>").unwrap();
        writer.write_chunk("hi</h1>").unwrap();
        writer.end().unwrap();

        assert_eq!(sink.contents(), "<h1>hi</h1>");
        assert_eq!(sink.writes(), vec!["<h1>", "hi</h1>"]);
        assert!(sink.is_ended());
        assert!(!sink.can_flush());
    }

    #[test]
    fn test_writer_sink() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_chunk("abc").unwrap();
        assert!(sink.can_flush());
        sink.flush().unwrap();

        assert_eq!(sink.into_inner(), b"abc");
    }

    #[tokio::test]
    async fn test_channel_sink_closes_on_end() {
        let (mut sink, rx) = ChannelSink::new();
        sink.write_chunk("a").unwrap();
        sink.write_chunk("b").unwrap();
        sink.end().unwrap();

        let received: Vec<Vec<u8>> = rx.collect().await;
        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_channel_sink_reports_dropped_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);

        let err = sink.write_chunk("a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_buffered_sink_writes_once_on_end() {
        let target = BufferSink::new();
        let mut sink = BufferedSink::new(target.clone());

        sink.write_chunk("<html>").unwrap();
        sink.write_chunk("</html>").unwrap();
        assert_eq!(target.contents(), "");

        sink.end().unwrap();
        assert_eq!(target.writes(), vec!["<html></html>"]);
        assert!(target.is_ended());
    }
}
