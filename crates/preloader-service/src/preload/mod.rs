//! Orchestrates batches of preload requests.
//!
//! A batch runs in three steps. First every request is classified under the pending-load lock:
//! keys that are cached resolve right away, keys that some batch is already loading are joined,
//! and everything else gets a new [`PendingLoad`] and is queued in a [`PriorityScheduler`].
//! Then the scheduler is drained in priority order, starting up to
//! [`max_concurrent_loads`](crate::config::PreloadConfig::max_concurrent_loads) loads at once.
//! Finally the batch waits for its own and all joined loads and returns one outcome per key.
//! If a batch goes away before it started a load that others joined, the first joiner to notice
//! takes the load over and queues it in its own scheduler.
//!
//! Loads are deduplicated across batches: for every key, at most one load is in flight at any
//! time, and everyone asking for that key receives the same
//! [`Payload`](crate::types::Payload) or the same error.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CapacityAdapter, MemoryMonitor, PreloadError, PreloadResult, ResourceCache, TtlReaper,
};
use crate::config::{CapacityAdapterConfig, Config};
use crate::download::Loaders;
use crate::scheduler::PriorityScheduler;
use crate::settings::RuntimeSettings;
use crate::types::{PreloadRequest, Priority, ResourceKind};

/// The outcome of a batch, one entry per requested key.
pub type PreloadOutcomes = BTreeMap<String, PreloadResult>;

type LoadChannel = Shared<oneshot::Receiver<PreloadResult>>;

/// What a batch sees when it waits for a load.
enum Joined {
    Resolved(PreloadResult),
    /// The owning batch went away before starting the load.
    Abandoned,
}

/// The lifecycle of a [`PendingLoad`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Waiting in a batch's scheduler.
    Queued,
    /// The loader is running.
    Loading,
    /// Loaded and cached. The record is discarded right after.
    Done,
    /// The load failed or was cancelled. The record is discarded right after.
    Failed,
}

/// A load that was started, or is about to be started, for a key.
pub struct PendingLoad {
    /// Distinguishes loads for the same key that were started at different times.
    id: u64,
    key: String,
    priority: Priority,
    kind: ResourceKind,
    state: LoadState,
    channel: LoadChannel,
    cancel: CancellationToken,
    abandoned: CancellationToken,
}

impl PendingLoad {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Waits for the outcome of this load.
    ///
    /// Resolves to [`PreloadError::Cancelled`] as soon as the load is cancelled, even if the load
    /// itself has not stopped yet. A load task that died without reporting back resolves to
    /// [`PreloadError::InternalError`].
    fn join(&self) -> BoxFuture<'static, Joined> {
        let channel = self.channel.clone();
        let cancel = self.cancel.clone();
        let abandoned = self.abandoned.clone();

        async move {
            let result = tokio::select! {
                biased;
                result = channel => match result {
                    Ok(result) => result,
                    Err(oneshot::Canceled) if cancel.is_cancelled() => Err(PreloadError::Cancelled),
                    Err(oneshot::Canceled) if abandoned.is_cancelled() => return Joined::Abandoned,
                    Err(oneshot::Canceled) => Err(PreloadError::InternalError),
                },
                _ = cancel.cancelled() => Err(PreloadError::Cancelled),
            };
            Joined::Resolved(result)
        }
        .boxed()
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The part of a [`PendingLoad`] that only the batch which created it holds.
struct OwnedLoad {
    id: u64,
    request: PreloadRequest,
    cancel: CancellationToken,
    // Declared before `sender`: when an undispatched load is dropped, joiners see that it was
    // abandoned before they see the closed channel.
    release: PendingRelease,
    sender: oneshot::Sender<PreloadResult>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingLoad>>>;

/// Discards the pending record of a load once its owner goes away.
///
/// If the load was never dispatched, it is marked abandoned so that a joiner can take it over.
/// A newer load for the same key is left alone. Must not be dropped while the pending table
/// is locked.
struct PendingRelease {
    pending: PendingTable,
    key: String,
    id: u64,
    dispatched: bool,
    abandoned: CancellationToken,
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.key).is_some_and(|load| load.id == self.id) {
            pending.remove(&self.key);
        }
        if !self.dispatched {
            self.abandoned.cancel();
        }
    }
}

struct PreloaderInner {
    cache: ResourceCache,
    settings: Arc<RuntimeSettings>,
    loaders: Loaders,
    /// Lock order: always take this before the cache lock.
    pending: PendingTable,
    next_id: AtomicU64,
    max_concurrent_loads: usize,
    reap_interval: Duration,
    adapter: CapacityAdapterConfig,
    shutdown: CancellationToken,
}

impl PreloaderInner {
    fn create_pending(&self, request: &PreloadRequest) -> (PendingLoad, OwnedLoad) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let cancel = CancellationToken::new();
        let abandoned = CancellationToken::new();

        let release = PendingRelease {
            pending: Arc::clone(&self.pending),
            key: request.key.clone(),
            id,
            dispatched: false,
            abandoned: abandoned.clone(),
        };

        let load = PendingLoad {
            id,
            key: request.key.clone(),
            priority: request.priority,
            kind: request.kind.clone(),
            state: LoadState::Queued,
            channel: receiver.shared(),
            cancel: cancel.clone(),
            abandoned,
        };
        let owned = OwnedLoad {
            id,
            request: request.clone(),
            cancel,
            release,
            sender,
        };
        (load, owned)
    }

    /// Starts the load on a separate task, so it completes even if the batch goes away.
    fn dispatch(self: &Arc<Self>, mut load: OwnedLoad) -> JoinHandle<()> {
        load.release.dispatched = true;
        let key = &load.request.key;
        if let Some(pending) = self.pending.lock().get_mut(key) {
            if pending.id == load.id {
                pending.state = LoadState::Loading;
            }
        }
        tracing::debug!(key = %key, priority = %load.request.priority, "Dispatching preload");

        let inner = Arc::clone(self);
        let loading = self.loaders.load(&load.request);

        tokio::spawn(async move {
            let OwnedLoad {
                id,
                request,
                cancel,
                release,
                sender,
            } = load;

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PreloadError::Cancelled),
                result = loading => result.map(Arc::new),
            };
            metric!(
                timer("preload.load.duration") = started.elapsed(),
                "kind" => request.kind.as_str(),
            );

            let result = inner.resolve(&request, id, &cancel, result);
            let status = match &result {
                Ok(_) => "ok",
                Err(err) => err.metrics_tag(),
            };
            metric!(counter("preload.load") += 1, "status" => status);

            sender.send(result).ok();
            drop(release);
        })
    }

    /// Caches a successful load and discards its pending record, in one critical section.
    fn resolve(
        &self,
        request: &PreloadRequest,
        id: u64,
        cancel: &CancellationToken,
        result: PreloadResult,
    ) -> PreloadResult {
        let key = &request.key;
        let mut pending = self.pending.lock();

        // cancellation happens under the same lock
        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(PreloadError::Cancelled),
            result => result,
        };

        match &result {
            Ok(payload) => {
                if let Err(err) = self.cache.put(key, Arc::clone(payload), request.priority) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        key = %key,
                        "Failed to cache preloaded resource"
                    );
                }
                tracing::debug!(key = %key, size = payload.len(), "Preloaded resource");
            }
            Err(PreloadError::Cancelled) => {
                tracing::debug!(key = %key, "Preload cancelled");
            }
            Err(err) => {
                tracing::warn!(
                    error = err as &dyn std::error::Error,
                    key = %key,
                    kind = %request.kind,
                    "Failed to preload resource"
                );
            }
        }

        if pending.get(key).is_some_and(|load| load.id == id) {
            if let Some(mut load) = pending.remove(key) {
                load.state = match result {
                    Ok(_) => LoadState::Done,
                    Err(_) => LoadState::Failed,
                };
                tracing::trace!(key = %key, state = ?load.state, "Discarded pending load");
            }
        }

        result
    }
}

/// Prefetches resources into a shared [`ResourceCache`].
///
/// Cheap to clone; all clones share the same cache, pending loads and settings.
#[derive(Clone)]
pub struct Preloader {
    inner: Arc<PreloaderInner>,
}

impl fmt::Debug for Preloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preloader")
            .field("cache", &self.inner.cache)
            .field("loaders", &self.inner.loaders)
            .field("settings", &self.inner.settings)
            .field("max_concurrent_loads", &self.inner.max_concurrent_loads)
            .finish_non_exhaustive()
    }
}

impl Preloader {
    /// Creates a preloader with an empty cache.
    pub fn new(config: &Config, loaders: Loaders) -> Result<Self, PreloadError> {
        let max_concurrent_loads = config.preload.max_concurrent_loads;
        if max_concurrent_loads == 0 {
            return Err(PreloadError::InvalidSetting {
                name: "max_concurrent_loads",
                value: max_concurrent_loads.to_string(),
            });
        }

        let cache = ResourceCache::new(config.cache.capacity)?;
        let settings = RuntimeSettings::new(
            config.cache.cache_duration,
            config.capacity_adapter.memory_threshold,
        )?;

        let inner = PreloaderInner {
            cache,
            settings: Arc::new(settings),
            loaders,
            pending: Default::default(),
            next_id: AtomicU64::new(0),
            max_concurrent_loads,
            reap_interval: config.cache.reap_interval,
            adapter: config.capacity_adapter,
            shutdown: CancellationToken::new(),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Preloads a batch of resources, returning the outcome for every requested key.
    ///
    /// Cached keys resolve to their cached payload without a load. Keys that are already being
    /// loaded, by this or another batch, are joined instead of loaded again. A failing key never
    /// affects the other keys of the batch.
    ///
    /// Loads start strictly in priority order. Each runs on its own task and completes even if
    /// this future is dropped. Keys that were not dispatched yet are released instead, and other
    /// batches waiting for them take the load over.
    pub async fn preload_all(
        &self,
        requests: impl IntoIterator<Item = PreloadRequest>,
    ) -> PreloadOutcomes {
        let mut outcomes = PreloadOutcomes::new();
        let mut requests: Vec<_> = requests.into_iter().collect();

        while !requests.is_empty() {
            requests = self.run_batch(requests, &mut outcomes).await;
            if !requests.is_empty() {
                tracing::debug!(count = requests.len(), "Taking over abandoned preloads");
                metric!(counter("preload.takeover") += requests.len() as i64);
            }
        }

        outcomes
    }

    /// Runs one round of a batch, returning the joined requests whose owner went away.
    async fn run_batch(
        &self,
        requests: Vec<PreloadRequest>,
        outcomes: &mut PreloadOutcomes,
    ) -> Vec<PreloadRequest> {
        let mut scheduler = PriorityScheduler::new();
        let mut owned = HashMap::new();
        let mut waiting = Vec::new();

        {
            let mut pending = self.inner.pending.lock();
            for request in requests {
                if let Some(entry) = self.inner.cache.get(&request.key) {
                    metric!(counter("preload.request") += 1, "status" => "hit");
                    outcomes.insert(request.key, Ok(entry.payload));
                    continue;
                }

                if let Some(load) = pending.get(&request.key) {
                    metric!(counter("preload.request") += 1, "status" => "joined");
                    waiting.push((request, load.join()));
                    continue;
                }

                metric!(counter("preload.request") += 1, "status" => "queued");
                let (load, owned_load) = self.inner.create_pending(&request);
                scheduler.enqueue(request.key.clone(), request.priority);
                waiting.push((request.clone(), load.join()));
                pending.insert(request.key.clone(), load);
                owned.insert(request.key, owned_load);
            }
        }

        tracing::debug!(
            queued = scheduler.len(),
            waiting = waiting.len(),
            cached = outcomes.len(),
            "Starting preload batch"
        );

        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < self.inner.max_concurrent_loads {
                let Ok(next) = scheduler.dequeue() else {
                    break;
                };
                let Some(load) = owned.remove(&next.key) else {
                    continue;
                };
                if load.cancel.is_cancelled() {
                    tracing::debug!(key = %next.key, "Skipping cancelled preload");
                    continue;
                }
                in_flight.push(self.inner.dispatch(load));
            }

            match in_flight.next().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Preload task failed"
                    );
                }
                None => break,
            }
        }

        let joined = waiting
            .into_iter()
            .map(|(request, join)| join.map(move |joined| (request, joined)));

        let mut abandoned = Vec::new();
        for (request, joined) in future::join_all(joined).await {
            match joined {
                Joined::Resolved(result) => {
                    outcomes.insert(request.key, result);
                }
                Joined::Abandoned => abandoned.push(request),
            }
        }
        abandoned
    }

    /// Cancels the pending load for `key`, returning whether there was one.
    ///
    /// A queued load is never started, a running load is dropped. Everyone waiting for the key
    /// resolves to [`PreloadError::Cancelled`]; other keys are unaffected. Requesting the key
    /// again afterwards starts a fresh load.
    pub fn cancel(&self, key: &str) -> bool {
        let mut pending = self.inner.pending.lock();
        match pending.remove(key) {
            Some(load) => {
                load.cancel.cancel();
                tracing::debug!(key, state = ?load.state, "Cancelled pending load");
                metric!(counter("preload.cancelled") += 1);
                true
            }
            None => false,
        }
    }

    /// The state of the pending load for `key`, if there is one.
    pub fn pending_state(&self, key: &str) -> Option<LoadState> {
        self.inner.pending.lock().get(key).map(PendingLoad::state)
    }

    /// The number of pending loads, across all batches.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    /// How long resources stay cached. Takes effect on the next reaper run.
    pub fn set_cache_duration(&self, duration: Duration) -> Result<(), PreloadError> {
        self.inner.settings.set_cache_duration(duration)
    }

    /// Changes the cache capacity right away, evicting the oldest entries if needed.
    pub fn set_cache_capacity(&self, capacity: usize) -> Result<(), PreloadError> {
        Ok(self.inner.cache.set_capacity(capacity)?)
    }

    /// Available memory in MiB below which the cache shrinks. Takes effect on the next adapter
    /// run.
    pub fn set_memory_threshold(&self, mib: u64) -> Result<(), PreloadError> {
        self.inner.settings.set_memory_threshold(mib)
    }

    /// Spawns the [`TtlReaper`] and, unless disabled, the [`CapacityAdapter`].
    ///
    /// The tasks run until the returned [`BackgroundTasks`] is dropped or stopped, or until
    /// [`shutdown`](Self::shutdown) is called.
    pub fn start_background_tasks(&self, monitor: Arc<dyn MemoryMonitor>) -> BackgroundTasks {
        let inner = &self.inner;
        let token = inner.shutdown.child_token();

        let reaper = TtlReaper::new(inner.cache.clone(), Arc::clone(&inner.settings));
        let mut handles = vec![reaper.spawn(inner.reap_interval, token.clone())];

        if inner.adapter.enabled {
            let adapter = CapacityAdapter::new(
                inner.cache.clone(),
                Arc::clone(&inner.settings),
                monitor,
                inner.adapter,
            );
            handles.push(adapter.spawn(inner.adapter.interval, token.clone()));
        }

        tracing::info!(
            reap_interval = ?inner.reap_interval,
            adapter_interval = ?inner.adapter.interval,
            adapter_enabled = inner.adapter.enabled,
            "Started background tasks"
        );

        BackgroundTasks { token, handles }
    }

    /// Stops all background tasks, cancels all pending loads and releases the cached payloads.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let cancelled = {
            let mut pending = self.inner.pending.lock();
            let cancelled = pending.len();
            for (_, load) in pending.drain() {
                load.cancel.cancel();
            }
            cancelled
        };
        self.inner.cache.clear();

        tracing::info!(cancelled, "Preloader shut down");
    }
}

/// Handle to the background tasks of a [`Preloader`].
///
/// Dropping it stops the tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stops the tasks and waits for them to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(err) = handle.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Background task failed"
                );
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
