//! Compatibility shim for render drivers with unstable instance ids.
//!
//! Some drivers allocate a fresh instance id each time they retry a
//! suspended unit of work, so the composite key of the retry never matches
//! the entry that resolved. The workaround cache mirrors entries under the
//! logical key alone for a short grace window, letting the retry find the
//! value instead of starting the computation again.
//!
//! Pending entries are mirrored without a timer so concurrent siblings join
//! the same computation. Done entries expire after the grace window; the
//! timer is rescheduled on every settlement and promotion. Error entries are
//! removed so the next request retries. A mirror only answers requests
//! made with the deps it was computed with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use edge_observability::SUSPENSE_TARGET;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::key::{deps_changed, Deps};
use crate::suspense::SuspenseEntry;

struct Mirrored {
    entry: SuspenseEntry,
    deps: Deps,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl Mirrored {
    fn cancel_expiry(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Mirrored>,
    next_generation: u64,
}

/// Logical key to entry side table with self-expiring values.
///
/// Cheap to clone; clones share the table, so several suspense caches can
/// use one.
#[derive(Clone)]
pub struct WorkaroundCache {
    state: Arc<Mutex<State>>,
    grace: Duration,
}

impl WorkaroundCache {
    /// Create an empty table with the given grace window.
    pub fn new(grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            grace,
        }
    }

    /// How long a resolved value stays reusable.
    pub fn grace_window(&self) -> Duration {
        self.grace
    }

    /// Number of mirrored entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if nothing is mirrored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a logical key is mirrored.
    pub fn contains(&self, logical: &str) -> bool {
        self.lock().entries.contains_key(logical)
    }

    /// Mirrored entry for `logical`. A mirror computed with other deps is
    /// dropped and reported as a miss.
    pub(crate) fn lookup(&self, logical: &str, deps: &[Value]) -> Option<SuspenseEntry> {
        let mut state = self.lock();
        let mirrored = state.entries.get(logical)?;
        if deps_changed(&mirrored.deps, deps) {
            if let Some(mut old) = state.entries.remove(logical) {
                old.cancel_expiry();
            }
            trace!(target: SUSPENSE_TARGET, key = %logical, "workaround entry superseded by new deps");
            return None;
        }
        Some(mirrored.entry.clone())
    }

    /// Mirror a state transition of the entry for `logical`.
    pub(crate) fn record(&self, logical: &str, entry: SuspenseEntry, deps: &[Value]) {
        let mut state = self.lock();

        if matches!(entry, SuspenseEntry::Error(_)) {
            if let Some(mut old) = state.entries.remove(logical) {
                old.cancel_expiry();
            }
            trace!(target: SUSPENSE_TARGET, key = %logical, "workaround entry dropped after error");
            return;
        }

        let done = matches!(entry, SuspenseEntry::Done(_));
        state.next_generation += 1;
        let generation = state.next_generation;
        let expiry = done.then(|| self.schedule_expiry(logical, generation));

        if let Some(mut old) = state.entries.insert(
            logical.to_string(),
            Mirrored {
                entry,
                deps: deps.to_vec(),
                generation,
                expiry,
            },
        ) {
            old.cancel_expiry();
        }
        trace!(target: SUSPENSE_TARGET, key = %logical, done, "workaround entry recorded");
    }

    /// Restart the grace window of a resolved entry.
    pub(crate) fn extend(&self, logical: &str) {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let Some(mirrored) = state.entries.get_mut(logical) else {
            return;
        };
        if !matches!(mirrored.entry, SuspenseEntry::Done(_)) {
            return;
        }
        mirrored.cancel_expiry();
        mirrored.generation = generation;
        mirrored.expiry = Some(self.schedule_expiry(logical, generation));
    }

    fn schedule_expiry(&self, logical: &str, generation: u64) -> JoinHandle<()> {
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let grace = self.grace;
        let logical = logical.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let current = state
                .entries
                .get(&logical)
                .is_some_and(|m| m.generation == generation);
            if current {
                state.entries.remove(&logical);
                trace!(target: SUSPENSE_TARGET, key = %logical, "workaround entry expired");
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkaroundCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkaroundCache")
            .field("entries", &self.len())
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::StreamError;
    use serde_json::json;
    use std::sync::Arc;

    fn done(value: u32) -> SuspenseEntry {
        SuspenseEntry::Done(Arc::new(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_entry_expires_after_grace() {
        let cache = WorkaroundCache::new(Duration::from_millis(1000));
        cache.record("k", done(1), &[]);
        assert!(cache.contains("k"));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(cache.contains("k"));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_reschedules_expiry() {
        let cache = WorkaroundCache::new(Duration::from_millis(1000));
        cache.record("k", done(1), &[]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        cache.extend("k");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(cache.contains("k"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_entry_has_no_timer() {
        let cache = WorkaroundCache::new(Duration::from_millis(10));
        let pending = futures::FutureExt::shared(futures::FutureExt::boxed(async {}));
        cache.record(
            "k",
            SuspenseEntry::Pending(crate::Suspended::from_shared(pending)),
            &[],
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_removes_entry() {
        let cache = WorkaroundCache::new(Duration::from_millis(1000));
        cache.record("k", done(1), &[]);
        cache.record(
            "k",
            SuspenseEntry::Error(StreamError::transient("k", "boom")),
            &[],
        );

        assert!(cache.is_empty());
        assert!(cache.lookup("k", &[]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resettlement_keeps_latest_timer() {
        let cache = WorkaroundCache::new(Duration::from_millis(1000));
        cache.record("k", done(1), &[]);
        tokio::time::sleep(Duration::from_millis(800)).await;
        cache.record("k", done(2), &[]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_deps_drop_mirror() {
        let cache = WorkaroundCache::new(Duration::from_millis(1000));
        cache.record("k", done(1), &[json!(1)]);

        assert!(cache.lookup("k", &[json!(1)]).is_some());
        assert!(cache.lookup("k", &[json!(2)]).is_none());
        assert!(!cache.contains("k"));
    }
}
