//! Deferred-close leases.

use std::fmt;

/// Keeps the stream open while held.
///
/// `ChunkOrchestrator::on_renderer_done` does not end the stream while
/// any lease is outstanding. Writes already queued keep flowing. The lease
/// is released exactly once, by `release` or on drop.
#[must_use = "dropping a lease releases it immediately"]
pub struct CloseLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CloseLease {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the lease, allowing the stream to end.
    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for CloseLease {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for CloseLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseLease")
            .field("released", &self.release.is_none())
            .finish()
    }
}
