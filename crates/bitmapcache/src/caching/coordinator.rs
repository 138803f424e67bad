use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{
    Bitmap, BitmapEntry, BitmapKey, BitmapLease, BitmapStore, Clock, EvictionPolicy, Insert,
    LoadError, StoreMonitor, TokioClock, policy_from_config,
};
use crate::config::CacheConfig;
use crate::utils::defer::defer;

/// The smallest interval the eviction scan runs at.
const MIN_EVICTION_INTERVAL: Duration = Duration::from_millis(1);

type LoadResult<K, T> = Result<Option<BitmapLease<K, T>>, LoadError>;
type LoadChannel<K, T> = Shared<oneshot::Receiver<LoadResult<K, T>>>;

enum Lookup<K: BitmapKey, T: Bitmap> {
    Cached(BitmapLease<K, T>),
    Pending(LoadChannel<K, T>),
}

struct CacheInner<K: BitmapKey, T: Bitmap> {
    store: Arc<BitmapStore<K, T>>,
    /// Loads that are currently running, keyed by the bitmap they produce.
    pending: Mutex<BTreeMap<K, LoadChannel<K, T>>>,
    policy: Arc<dyn EvictionPolicy>,
    clock: Arc<dyn Clock>,
}

impl<K: BitmapKey, T: Bitmap> CacheInner<K, T> {
    /// Leases the stored bitmap, or returns a channel for the load producing it.
    ///
    /// Starts a new load via `loader` if none is running for the key.
    fn lookup_or_load<F, Fut>(self: &Arc<Self>, key: K, loader: F) -> Lookup<K, T>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let mut pending = self.pending.lock();

        // A load may have finished after the first lookup. Loads remove themselves from
        // `pending` before they publish their result, so checking the store again while holding
        // the lock cannot miss a result.
        if let Some(lease) = self.store.lease(&key) {
            return Lookup::Cached(lease);
        }

        if let Some(channel) = pending.get(&key) {
            metric!(counter("bitmaps.load.coalesced") += 1);
            tracing::trace!(?key, "Joining pending bitmap load");
            return Lookup::Pending(channel.clone());
        }

        // `loader` may panic here. `pending` does not poison, so that only fails this request.
        let load = loader(key.clone());
        let channel = self.spawn_load(key.clone(), load);
        pending.insert(key, channel.clone());
        Lookup::Pending(channel)
    }

    /// Runs `load` on the runtime, and returns a channel for its outcome.
    ///
    /// The caller must register the channel in `pending` while still holding the lock.
    fn spawn_load<Fut>(self: &Arc<Self>, key: K, load: Fut) -> LoadChannel<K, T>
    where
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let done_token = {
            let inner = Arc::clone(self);
            let key = key.clone();
            defer(move || {
                inner.pending.lock().remove(&key);
            })
        };

        tracing::trace!(?key, "Spawning bitmap load");

        let inner = Arc::clone(self);
        let task = async move {
            let span = sentry::configure_scope(|scope| scope.get_span());
            let ctx =
                sentry::TransactionContext::continue_from_span("Bitmap Load", "load_bitmap", span);
            let transaction = sentry::start_transaction(ctx);
            sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

            metric!(counter("bitmaps.load.started") += 1);
            let start = Instant::now();

            let result = match AssertUnwindSafe(load).catch_unwind().await {
                Ok(Ok(Some(bitmap))) => Ok(Some(inner.insert_bitmap(key, bitmap))),
                Ok(Ok(None)) => {
                    tracing::debug!(?key, "Bitmap source produced no image");
                    Ok(None)
                }
                Ok(Err(error)) => {
                    metric!(counter("bitmaps.load.failed") += 1, "reason" => "error");
                    tracing::warn!(?key, "Failed to load bitmap: {error:#}");
                    Err(LoadError::failed(error))
                }
                Err(_panic) => {
                    metric!(counter("bitmaps.load.failed") += 1, "reason" => "panic");
                    tracing::error!(?key, "Bitmap loader panicked");
                    Err(LoadError::Cancelled)
                }
            };

            metric!(timer("bitmaps.load.duration") = start.elapsed());
            transaction.finish();

            // Unregister first, so new requests either find the bitmap in the store or start
            // over instead of joining a channel that already fired.
            done_token.run();
            // Nobody might be waiting anymore, in which case the lease is dropped right here.
            sender.send(result).ok();
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        receiver.shared()
    }

    /// Stores a freshly created bitmap, unless the key is already present.
    ///
    /// Returns a lease on whichever bitmap ends up stored under `key`.
    fn insert_bitmap(&self, key: K, bitmap: T) -> BitmapLease<K, T> {
        let entry = BitmapEntry::new(key, bitmap, Arc::clone(&self.clock));
        let lease = match self.store.insert(entry) {
            Insert::Inserted(lease) => lease,
            Insert::Occupied { winner, candidate } => {
                metric!(counter("bitmaps.insert.lost_race") += 1);
                tracing::debug!(
                    key = ?candidate.key(),
                    "Discarding bitmap for a key that is already cached"
                );
                winner
            }
        };
        metric!(gauge("bitmaps.entries") = self.store.len() as u64);
        lease
    }

    /// Frees every unreferenced bitmap the policy considers expired.
    fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        for candidate in self.store.eviction_candidates() {
            let state = candidate.state();
            // Referenced entries are ordered last, nothing after this one can be evicted.
            if state.refcount > 0 {
                break;
            }
            if !self.policy.should_evict(&state, now) {
                continue;
            }

            let removed = self
                .store
                .remove_if(candidate.key(), |state| self.policy.should_evict(state, now));
            match removed {
                Some(entry) => {
                    tracing::debug!(
                        key = ?entry.key(),
                        bytes = state.estimated_bytes,
                        "Evicting idle bitmap"
                    );
                    evicted += 1;
                }
                None => {
                    tracing::trace!(key = ?candidate.key(), "Bitmap was acquired during eviction");
                }
            }
        }

        if evicted > 0 {
            metric!(counter("bitmaps.evicted") += evicted as i64, "reason" => "idle");
        }
        metric!(gauge("bitmaps.entries") = self.store.len() as u64);

        evicted
    }
}

async fn eviction_loop<K: BitmapKey, T: Bitmap>(
    inner: Arc<CacheInner<K, T>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.evict_idle();
            }
        }
    }

    tracing::debug!("Bitmap eviction stopped");
}

/// Configures and creates a [`BitmapCache`].
pub struct BitmapCacheBuilder {
    eviction_interval: Duration,
    policy: Arc<dyn EvictionPolicy>,
    clock: Arc<dyn Clock>,
}

impl BitmapCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the eviction interval and idle timeout from `config`.
    pub fn config(mut self, config: &CacheConfig) -> Self {
        self.eviction_interval = config.eviction_interval;
        self.policy = policy_from_config(config);
        self
    }

    /// How often the background scan looks for bitmaps to evict.
    ///
    /// Intervals below one millisecond are raised to one millisecond.
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn policy(mut self, policy: impl EvictionPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// The clock used to timestamp idle entries.
    ///
    /// Defaults to [`TokioClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates the cache and starts its eviction scan.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn build<K: BitmapKey, T: Bitmap>(self) -> BitmapCache<K, T> {
        let inner = Arc::new(CacheInner {
            store: Arc::new(BitmapStore::new()),
            pending: Mutex::new(BTreeMap::new()),
            policy: self.policy,
            clock: self.clock,
        });

        let interval = self.eviction_interval.max(MIN_EVICTION_INTERVAL);
        let shutdown = CancellationToken::new();
        tokio::spawn(
            eviction_loop(Arc::clone(&inner), interval, shutdown.clone())
                .bind_hub(Hub::new_from_top(Hub::current())),
        );

        BitmapCache { inner, shutdown }
    }
}

impl Default for BitmapCacheBuilder {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            eviction_interval: config.eviction_interval,
            policy: policy_from_config(&config),
            clock: Arc::new(TokioClock),
        }
    }
}

impl fmt::Debug for BitmapCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapCacheBuilder")
            .field("eviction_interval", &self.eviction_interval)
            .finish_non_exhaustive()
    }
}

/// A reference-counted cache of decoded bitmaps.
///
/// Bitmaps are loaded on demand through [`get_or_add`](Self::get_or_add), at most once at a time
/// per key, and handed out as [`BitmapLease`]s. A background task frees bitmaps that nobody
/// leases anymore once the [`EvictionPolicy`] allows it. The task stops when the cache is
/// dropped or [`shutdown`](Self::shutdown) is called.
///
/// See the [module docs](super) for details.
pub struct BitmapCache<K: BitmapKey, T: Bitmap> {
    inner: Arc<CacheInner<K, T>>,
    shutdown: CancellationToken,
}

impl<K: BitmapKey, T: Bitmap> BitmapCache<K, T> {
    /// Creates a cache configured by `config`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(config: &CacheConfig) -> Self {
        BitmapCacheBuilder::new().config(config).build()
    }

    /// Returns a lease on the bitmap for `key`, loading it if necessary.
    ///
    /// When the bitmap is stored already, the lease is returned right away and `loader` is not
    /// called. When another request is already loading the key, this waits for that load.
    /// Otherwise, `loader` is called once and the returned future is spawned onto the runtime,
    /// so dropping the future returned by this function does not abort the load for others.
    ///
    /// Returns `Ok(None)` when the loader produced no bitmap. Loader errors are returned to all
    /// waiting requests and are not cached.
    pub async fn get_or_add<F, Fut>(
        &self,
        key: K,
        loader: F,
    ) -> Result<Option<BitmapLease<K, T>>, LoadError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        metric!(counter("bitmaps.access") += 1);

        let channel = match self.lookup(key, loader) {
            Lookup::Cached(lease) => {
                metric!(counter("bitmaps.memory.hit") += 1);
                return Ok(Some(lease));
            }
            Lookup::Pending(channel) => channel,
        };

        channel.await.unwrap_or_else(|canceled| {
            tracing::error!("Bitmap load was cancelled before it finished");
            Err(LoadError::from(canceled))
        })
    }

    fn lookup<F, Fut>(&self, key: K, loader: F) -> Lookup<K, T>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        match self.inner.store.lease(&key) {
            Some(lease) => Lookup::Cached(lease),
            None => self.inner.lookup_or_load(key, loader),
        }
    }

    /// Returns a lease on the bitmap for `key`, if it is stored.
    pub fn get(&self, key: &K) -> Option<BitmapLease<K, T>> {
        self.inner.store.lease(key)
    }

    /// Stores an already decoded bitmap.
    ///
    /// If `key` is already present, `bitmap` is dropped and a lease on the stored bitmap is
    /// returned instead.
    pub fn insert(&self, key: K, bitmap: T) -> BitmapLease<K, T> {
        self.inner.insert_bitmap(key, bitmap)
    }

    /// Runs one eviction scan right away, returning the number of freed bitmaps.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_idle()
    }

    /// Frees all bitmaps that are not currently leased, regardless of the policy.
    ///
    /// Returns the number of freed bitmaps.
    pub fn clear(&self) -> usize {
        let removed = self.inner.store.remove_unreferenced();
        let count = removed.len();
        drop(removed);

        tracing::debug!(count, "Cleared unreferenced bitmaps");
        metric!(counter("bitmaps.evicted") += count as i64, "reason" => "clear");
        metric!(gauge("bitmaps.entries") = self.inner.store.len() as u64);
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.store.contains(key)
    }

    /// The number of live leases on the bitmap for `key`, if it is stored.
    pub fn refcount(&self, key: &K) -> Option<usize> {
        self.inner.store.state(key).map(|state| state.refcount)
    }

    /// The number of stored bitmaps.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// The number of loads currently running.
    pub fn pending_loads(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// The underlying store, for diagnostics.
    pub fn store(&self) -> &Arc<BitmapStore<K, T>> {
        &self.inner.store
    }

    /// Creates a [`StoreMonitor`] for this cache. The monitor still needs to be started.
    pub fn monitor(&self, interval: Duration) -> StoreMonitor<K, T> {
        StoreMonitor::new(Arc::clone(&self.inner.store), interval)
    }

    /// Stops the background eviction scan.
    ///
    /// Stored bitmaps stay cached, and [`evict_idle`](Self::evict_idle) and
    /// [`clear`](Self::clear) keep working. Calling this more than once has no effect.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("Shutting down bitmap eviction");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<K: BitmapKey, T: Bitmap> Drop for BitmapCache<K, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<K: BitmapKey, T: Bitmap> fmt::Debug for BitmapCache<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .inner
            .pending
            .try_lock()
            .map(|pending| pending.len())
            .unwrap_or_default();
        f.debug_struct("BitmapCache")
            .field("store", &self.inner.store)
            .field("pending loads", &pending)
            .field("shut down", &self.shutdown.is_cancelled())
            .finish()
    }
}
