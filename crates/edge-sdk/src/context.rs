//! Per-pass contexts for units of work.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use edge_cache::{
    serialize_island, stringify_key, Deps, IslandIndex, Suspense, SuspenseCache, SuspenseKey,
};
use edge_core::{StreamConfig, StreamResult};
use edge_observability::SUSPENSE_TARGET;
use edge_streaming::{Chunk, ChunkOrchestrator, CloseLease, InjectOptions, Written};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Server-side context of one render pass.
///
/// Carries the pass's suspense cache and the orchestrator resolved values
/// are injected into. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RenderContext {
    cache: SuspenseCache,
    orchestrator: ChunkOrchestrator,
}

impl RenderContext {
    /// Create a context over an existing cache and orchestrator.
    pub fn new(cache: SuspenseCache, orchestrator: ChunkOrchestrator) -> Self {
        Self {
            cache,
            orchestrator,
        }
    }

    /// The suspense cache of this pass.
    pub fn cache(&self) -> &SuspenseCache {
        &self.cache
    }

    /// The orchestrator of this pass.
    pub fn orchestrator(&self) -> &ChunkOrchestrator {
        &self.orchestrator
    }

    /// Queue an out-of-band chunk.
    pub fn inject_chunk(
        &self,
        chunk: impl Into<Chunk>,
        options: InjectOptions,
    ) -> StreamResult<Written> {
        self.orchestrator.inject_chunk(chunk, options)
    }

    /// Keep the stream open until the lease is released.
    pub fn do_not_close(&self) -> CloseLease {
        self.orchestrator.do_not_close()
    }

    /// Request an async value for the unit of work `instance_id`.
    ///
    /// The resolved value is injected as a data island before the suspended
    /// unit of work is woken, so the client finds it during replay.
    pub fn use_async<K, T, F, Fut>(&self, key: &K, instance_id: &str, async_fn: F) -> Suspense<T>
    where
        K: Serialize + ?Sized,
        T: Serialize + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.use_async_with_deps(key, instance_id, Deps::new(), async_fn)
    }

    /// Like `use_async`, recording `deps` with the value and its island.
    pub fn use_async_with_deps<K, T, F, Fut>(
        &self,
        key: &K,
        instance_id: &str,
        deps: Deps,
        async_fn: F,
    ) -> Suspense<T>
    where
        K: Serialize + ?Sized,
        T: Serialize + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = match SuspenseKey::from_key(key, instance_id) {
            Ok(key) => key,
            Err(err) => return Suspense::Error(err),
        };

        let orchestrator = self.orchestrator.clone();
        let island_key = key.logical().to_string();
        let element_id = instance_id.to_string();
        let island_deps = deps.clone();

        self.cache
            .request::<T>(&key)
            .deps(deps)
            .unstable_identity()
            .resolve(move || {
                let computation = async_fn();
                async move {
                    let value = computation.await?;
                    let island = serialize_island(&island_key, Some(&element_id), &value, &island_deps)?;
                    orchestrator.inject_chunk(island, InjectOptions::default())?;
                    Ok::<T, anyhow::Error>(value)
                }
            })
    }
}

/// Client-side context: answers requests from delivered data islands.
#[derive(Clone, Debug)]
pub struct HydrationContext {
    islands: Arc<Mutex<IslandIndex>>,
    cache: SuspenseCache,
}

impl HydrationContext {
    /// Create a context over already scanned islands.
    pub fn new(islands: IslandIndex, config: &StreamConfig) -> Self {
        Self {
            islands: Arc::new(Mutex::new(islands)),
            cache: SuspenseCache::new(config),
        }
    }

    /// Create a context from delivered markup.
    pub fn from_html(html: &str, config: &StreamConfig) -> Self {
        Self::new(IslandIndex::scan(html), config)
    }

    /// Index islands from markup delivered later. Returns how many were added.
    pub fn absorb(&self, html: &str) -> usize {
        self.islands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from(html)
    }

    /// The suspense cache of this context.
    pub fn cache(&self) -> &SuspenseCache {
        &self.cache
    }

    /// Request an async value, preferring the delivered island for `key`.
    pub fn use_async<K, T, F, Fut>(&self, key: &K, deps: Deps, async_fn: F) -> Suspense<T>
    where
        K: Serialize + ?Sized,
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let logical = match stringify_key(key) {
            Ok(logical) => logical,
            Err(err) => return Suspense::Error(err),
        };
        let key = match SuspenseKey::new(logical.clone(), "") {
            Ok(key) => key,
            Err(err) => return Suspense::Error(err),
        };

        let islands = self.islands.clone();
        let lookup_deps = deps.clone();
        self.cache
            .request::<T>(&key)
            .deps(deps)
            .sync_resolver(move || {
                let islands = islands.lock().unwrap_or_else(PoisonError::into_inner);
                match islands.locate_value::<T>(&logical, &lookup_deps) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(target: SUSPENSE_TARGET, error = %err, "data island ignored");
                        None
                    }
                }
            })
            .resolve(async_fn)
    }
}
