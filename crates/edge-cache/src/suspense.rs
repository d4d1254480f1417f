//! Per-render-pass suspense cache.
//!
//! Units of work request asynchronously computed values by key. A request
//! never blocks: it returns the value, a `Suspended` future to await before
//! retrying, or the error of a failed computation. Lookup order:
//! 1. An entry for the composite key in this pass's table
//! 2. The synchronous resolver, e.g. a value already delivered to the client
//! 3. For unstable-identity call sites, the workaround cache by logical key
//! 4. The resolver; a started computation is stored as pending
//!
//! Failed entries are removed when dispatched, so the next request retries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use edge_core::{StreamConfig, StreamError};
use edge_observability::{SuspenseStats, SUSPENSE_TARGET};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::guard::LoopGuard;
use crate::key::{deps_changed, Deps, SuspenseKey};
use crate::workaround::WorkaroundCache;

/// Type-erased resolved value.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Future a suspended unit of work awaits before it is retried.
///
/// Resolves once the computation settled and the cache was updated.
/// Every request for the same pending entry gets a clone of the same future.
#[derive(Clone)]
pub struct Suspended(Shared<BoxFuture<'static, ()>>);

impl Suspended {
    pub(crate) fn from_shared(inner: Shared<BoxFuture<'static, ()>>) -> Self {
        Self(inner)
    }

    /// Check if both handles wait on the same computation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Future for Suspended {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl fmt::Debug for Suspended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Suspended(..)")
    }
}

/// State of an async computation.
#[derive(Clone)]
pub(crate) enum SuspenseEntry {
    Pending(Suspended),
    Done(ErasedValue),
    Error(StreamError),
}

impl SuspenseEntry {
    fn state(&self) -> EntryState {
        match self {
            Self::Pending(_) => EntryState::Pending,
            Self::Done(_) => EntryState::Done,
            Self::Error(_) => EntryState::Error,
        }
    }
}

/// Observable state of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Done,
    Error,
}

/// Where a request found its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// Existing entry in this pass's table.
    Hit,
    /// Synchronous resolver produced the value.
    Hydrated,
    /// Workaround cache supplied the entry.
    Reused,
    /// The resolver was invoked.
    Miss,
}

impl fmt::Display for LookupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Hydrated => write!(f, "HYDRATED"),
            Self::Reused => write!(f, "REUSED"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// Outcome of a suspense request.
#[derive(Debug)]
pub enum Suspense<T> {
    /// The value is available.
    Done(T),
    /// Await the future, then request again.
    Pending(Suspended),
    /// The computation failed; the next request retries it.
    Error(StreamError),
}

impl<T> Suspense<T> {
    /// Check if the request suspended.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Get the value if available.
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            _ => None,
        }
    }

    /// Map the resolved value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Suspense<U> {
        match self {
            Self::Done(value) => Suspense::Done(f(value)),
            Self::Pending(suspended) => Suspense::Pending(suspended),
            Self::Error(err) => Suspense::Error(err),
        }
    }
}

/// What a resolver produced when invoked.
pub enum Resolve<T> {
    /// A computation to run.
    Async(BoxFuture<'static, anyhow::Result<T>>),
    /// A plain value. Resolvers should return futures; this is tolerated.
    Sync(T),
}

struct Slot {
    entry: SuspenseEntry,
    deps: Deps,
}

struct CacheInner {
    table: Mutex<HashMap<String, Slot>>,
    workaround: WorkaroundCache,
    guard: Mutex<LoopGuard>,
    stats: Mutex<SuspenseStats>,
}

impl CacheInner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, f: impl FnOnce(&mut SuspenseStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn lookup(&self, key: &SuspenseKey, deps: &Deps) -> Option<SuspenseEntry> {
        let mut table = self.table();
        let changed = deps_changed(&table.get(key.id())?.deps, deps);
        if changed {
            debug!(target: SUSPENSE_TARGET, key = %key, "deps changed, entry superseded");
            table.remove(key.id());
            return None;
        }
        table.get(key.id()).map(|slot| slot.entry.clone())
    }

    fn store(&self, key: &SuspenseKey, entry: SuspenseEntry, deps: Deps) {
        self.table()
            .insert(key.id().to_string(), Slot { entry, deps });
    }

    /// Settle a pending entry unless it was superseded meanwhile.
    ///
    /// Returns whether the entry was updated.
    fn settle(&self, key: &SuspenseKey, suspended: &Suspended, entry: SuspenseEntry) -> bool {
        let mut table = self.table();
        match table.get_mut(key.id()) {
            Some(slot) if matches!(&slot.entry, SuspenseEntry::Pending(p) if p.ptr_eq(suspended)) => {
                trace!(target: SUSPENSE_TARGET, key = %key, state = ?entry.state(), "settled");
                slot.entry = entry;
                true
            }
            _ => {
                trace!(target: SUSPENSE_TARGET, key = %key, "stale settlement ignored");
                false
            }
        }
    }

    fn remove_failed(&self, key: &SuspenseKey) {
        let mut table = self.table();
        if matches!(table.get(key.id()), Some(Slot { entry: SuspenseEntry::Error(_), .. })) {
            table.remove(key.id());
        }
    }
}

/// Table of async computations for one render pass.
///
/// Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct SuspenseCache {
    inner: Arc<CacheInner>,
}

impl SuspenseCache {
    /// Create a cache with its own workaround table.
    pub fn new(config: &StreamConfig) -> Self {
        Self::with_workaround(config, WorkaroundCache::new(config.grace_window()))
    }

    /// Create a cache sharing an existing workaround table.
    pub fn with_workaround(config: &StreamConfig, workaround: WorkaroundCache) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                table: Mutex::new(HashMap::new()),
                workaround,
                guard: Mutex::new(LoopGuard::new(&config.loop_guard)),
                stats: Mutex::new(SuspenseStats::default()),
            }),
        }
    }

    /// Start a request for `key`.
    pub fn request<'a, T>(&'a self, key: &'a SuspenseKey) -> SuspenseRequest<'a, T>
    where
        T: Clone + Send + Sync + 'static,
    {
        SuspenseRequest {
            cache: self,
            key,
            deps: Vec::new(),
            sync_resolver: None,
            unstable_identity: false,
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SuspenseStats {
        *self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The workaround table in use.
    pub fn workaround(&self) -> &WorkaroundCache {
        &self.inner.workaround
    }

    /// Number of entries in this pass's table.
    pub fn len(&self) -> usize {
        self.inner.table().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State of the entry for `key`, if any.
    pub fn entry_state(&self, key: &SuspenseKey) -> Option<EntryState> {
        self.inner.table().get(key.id()).map(|slot| slot.entry.state())
    }
}

impl Default for SuspenseCache {
    fn default() -> Self {
        Self::new(&StreamConfig::default())
    }
}

impl fmt::Debug for SuspenseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspenseCache")
            .field("entries", &self.len())
            .field("workaround", &self.inner.workaround)
            .finish()
    }
}

/// Builder for one suspense request.
pub struct SuspenseRequest<'a, T> {
    cache: &'a SuspenseCache,
    key: &'a SuspenseKey,
    deps: Deps,
    sync_resolver: Option<Box<dyn FnOnce() -> Option<T> + 'a>>,
    unstable_identity: bool,
}

impl<'a, T> SuspenseRequest<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Dependencies of the value. A change supersedes the cached entry.
    pub fn deps(mut self, deps: Deps) -> Self {
        self.deps = deps;
        self
    }

    /// Resolver consulted before starting the computation.
    pub fn sync_resolver(mut self, resolver: impl FnOnce() -> Option<T> + 'a) -> Self {
        self.sync_resolver = Some(Box::new(resolver));
        self
    }

    /// Mark the call site as having an unstable instance id.
    pub fn unstable_identity(mut self) -> Self {
        self.unstable_identity = true;
        self
    }

    /// Finish the request with an async resolver.
    pub fn resolve<F, Fut>(self, resolver: F) -> Suspense<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.resolve_with(move || Ok(Resolve::Async(resolver().boxed())))
    }

    /// Finish the request with a resolver that may fail or return a plain value.
    pub fn resolve_with<F>(self, resolver: F) -> Suspense<T>
    where
        F: FnOnce() -> anyhow::Result<Resolve<T>>,
    {
        let Self {
            cache,
            key,
            deps,
            sync_resolver,
            unstable_identity,
        } = self;
        let inner = &cache.inner;

        let (entry, source) = match inner.lookup(key, &deps) {
            Some(entry) => (entry, LookupSource::Hit),
            None => match sync_resolver.and_then(|resolve| resolve()) {
                Some(value) => {
                    let entry = SuspenseEntry::Done(Arc::new(value));
                    inner.store(key, entry.clone(), deps);
                    (entry, LookupSource::Hydrated)
                }
                None => match unstable_identity
                    .then(|| inner.workaround.lookup(key.logical(), &deps))
                    .flatten()
                {
                    Some(entry) => {
                        if matches!(entry, SuspenseEntry::Done(_)) {
                            inner.store(key, entry.clone(), deps);
                            inner.workaround.extend(key.logical());
                        }
                        (entry, LookupSource::Reused)
                    }
                    None => match resolver() {
                        Ok(resolved) => {
                            let entry = start(inner, key, resolved, deps, unstable_identity);
                            (entry, LookupSource::Miss)
                        }
                        Err(err) => {
                            inner.count(|s| s.misses += 1);
                            let err = StreamError::transient(key.to_string(), format!("{:#}", err));
                            (SuspenseEntry::Error(err), LookupSource::Miss)
                        }
                    },
                },
            },
        };

        inner.count(|s| match source {
            LookupSource::Hit | LookupSource::Hydrated => s.hits += 1,
            LookupSource::Reused => s.reused += 1,
            LookupSource::Miss => {}
        });
        trace!(target: SUSPENSE_TARGET, key = %key, source = %source, state = ?entry.state(), "request");

        dispatch(inner, key, entry)
    }
}

/// Store the entry for a freshly invoked resolver.
fn start<T>(
    inner: &Arc<CacheInner>,
    key: &SuspenseKey,
    resolved: Resolve<T>,
    deps: Deps,
    unstable_identity: bool,
) -> SuspenseEntry
where
    T: Send + Sync + 'static,
{
    inner.count(|s| s.misses += 1);

    let future = match resolved {
        Resolve::Sync(value) => {
            warn!(
                target: SUSPENSE_TARGET,
                key = %key,
                "resolver returned a plain value instead of a future"
            );
            let entry = SuspenseEntry::Done(Arc::new(value));
            if unstable_identity {
                inner.workaround.record(key.logical(), entry.clone(), &deps);
            }
            inner.store(key, entry.clone(), deps);
            return entry;
        }
        Resolve::Async(future) => future,
    };

    let (wake, woken) = oneshot::channel::<()>();
    let suspended = Suspended::from_shared(
        async move {
            let _ = woken.await;
        }
        .boxed()
        .shared(),
    );
    let entry = SuspenseEntry::Pending(suspended.clone());
    if unstable_identity {
        inner.workaround.record(key.logical(), entry.clone(), &deps);
    }
    inner.store(key, entry.clone(), deps.clone());

    let inner = inner.clone();
    let key = key.clone();
    tokio::spawn(async move {
        let settled = match future.await {
            Ok(value) => SuspenseEntry::Done(Arc::new(value)),
            Err(err) => SuspenseEntry::Error(StreamError::transient(
                key.to_string(),
                format!("{:#}", err),
            )),
        };
        let applied = inner.settle(&key, &suspended, settled.clone());
        if applied && unstable_identity {
            inner.workaround.record(key.logical(), settled, &deps);
        }
        let _ = wake.send(());
    });

    entry
}

fn dispatch<T>(inner: &CacheInner, key: &SuspenseKey, entry: SuspenseEntry) -> Suspense<T>
where
    T: Clone + 'static,
{
    match entry {
        SuspenseEntry::Pending(suspended) => {
            let checked = inner
                .guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .check(key.id());
            if let Err(err) = checked {
                error!(target: SUSPENSE_TARGET, key = %key, error = %err, "suspension loop detected");
                return Suspense::Error(err);
            }
            inner.count(|s| s.suspensions += 1);
            Suspense::Pending(suspended)
        }
        SuspenseEntry::Error(err) => {
            inner.remove_failed(key);
            inner.count(|s| s.errors += 1);
            error!(target: SUSPENSE_TARGET, key = %key, error = %err, "async value failed");
            Suspense::Error(err)
        }
        SuspenseEntry::Done(value) => match value.downcast_ref::<T>() {
            Some(value) => {
                inner
                    .guard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reset(key.id());
                Suspense::Done(value.clone())
            }
            None => Suspense::Error(StreamError::usage(format!(
                "value cached for key {} has a different type than requested ({})",
                key,
                std::any::type_name::<T>()
            ))),
        },
    }
}
