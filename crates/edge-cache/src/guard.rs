//! Infinite-suspension guard.

use std::collections::HashMap;
use std::time::Duration;

use edge_core::{LoopGuardConfig, StreamError, StreamResult};
use tokio::time::Instant;

/// Counts pending dispatches per key inside a fixed window.
///
/// A render driver that retries a unit of work without awaiting its
/// suspension would spin forever; past the threshold the guard fails the
/// request with an internal error instead.
#[derive(Debug)]
pub struct LoopGuard {
    window: Duration,
    max_pending: u32,
    counters: HashMap<String, (Instant, u32)>,
}

impl LoopGuard {
    /// Create a guard from configuration.
    pub fn new(config: &LoopGuardConfig) -> Self {
        Self {
            window: config.window(),
            max_pending: config.max_pending_requests,
            counters: HashMap::new(),
        }
    }

    /// Record one pending dispatch for `id`.
    pub fn check(&mut self, id: &str) -> StreamResult<()> {
        let now = Instant::now();
        let window = self.window;
        let (started, count) = self
            .counters
            .entry(id.to_string())
            .or_insert((now, 0));

        if now.duration_since(*started) >= window {
            *started = now;
            *count = 0;
        }
        *count += 1;

        if *count > self.max_pending {
            return Err(StreamError::internal(format!(
                "key {} suspended {} times within {:?}; the render driver retries without awaiting the suspension",
                id.replace(crate::KEY_SEPARATOR, "@"),
                count,
                window
            )));
        }
        Ok(())
    }

    /// Forget the counter for `id`.
    pub fn reset(&mut self, id: &str) {
        self.counters.remove(id);
    }
}
