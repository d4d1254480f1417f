//! Stream lifecycle tracking.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of a single output stream.
///
/// Transitions only move forward: `Unstarted -> Streaming -> Ended`.
/// `Unstarted -> Ended` is allowed for streams that are aborted or fail
/// before the head write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StreamState {
    /// Nothing has been written yet.
    #[default]
    Unstarted,
    /// The head write happened, queued writes may flow.
    Streaming,
    /// No further writes are accepted.
    Ended,
}

impl StreamState {
    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: StreamState) -> bool {
        next > *self
    }

    /// Whether writes have started.
    pub fn has_started(&self) -> bool {
        !matches!(self, Self::Unstarted)
    }

    /// Whether the stream is closed for good.
    pub fn has_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "UNSTARTED"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Ended => write!(f, "ENDED"),
        }
    }
}

/// Timing context for observability.
#[derive(Debug, Clone)]
pub struct TimingContext {
    start: Instant,
    marks: HashMap<String, Instant>,
}

impl TimingContext {
    /// Mark name for the head write.
    pub const HEAD_WRITTEN: &'static str = "head_written";
    /// Mark name for the end of the stream.
    pub const ENDED: &'static str = "ended";

    /// Create a new timing context.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            marks: HashMap::new(),
        }
    }

    /// Record a timing mark. The first mark of a given name wins.
    pub fn mark(&mut self, name: &str) {
        self.marks
            .entry(name.to_string())
            .or_insert_with(Instant::now);
    }

    /// Time elapsed until a mark, if it was recorded.
    pub fn since_start(&self, name: &str) -> Option<Duration> {
        self.marks.get(name).map(|t| t.duration_since(self.start))
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get time to the head write.
    pub fn time_to_head(&self) -> Option<Duration> {
        self.since_start(Self::HEAD_WRITTEN)
    }

    /// Get time until the stream ended, or the elapsed time while it is still open.
    pub fn total_time(&self) -> Duration {
        self.since_start(Self::ENDED)
            .unwrap_or_else(|| self.elapsed())
    }
}

impl Default for TimingContext {
    fn default() -> Self {
        Self::new()
    }
}
