//! The injectable sync engine.
//!
//! One [`SyncEngine`] owns every cache and in-flight registry of a session.
//! Each resource kind has its own [`ResourceStore`]: a TTL cache plus a
//! coalescer whose single flight per key is the only writer of that key.
//! Cloning the engine is cheap and shares all state.

use crate::config::EngineConfig;
use crate::events::{InvalidationBus, InvalidationEvent};
use crate::resource::Resource;
use chrono::{DateTime, Utc};
use perpsync_cache::{
    Cached, Coalescer, Freshness, PersistedMirror, TtlCache, TtlPolicy, WriteOutcome,
};
use perpsync_core::{
    CacheKey, Clock, NetworkId, RawMarketPrice, ResourceKind, SyncResult, SystemClock,
};
use perpsync_remote::{DynChainReader, RetryScheduler};
use perpsync_snapshot::{
    BookSnapshot, BookSnapshotBuilder, MarginSnapshot, MarginSummaryBuilder, OrderSnapshot,
    OrderSnapshotBuilder, PositionSnapshot, PositionSnapshotBuilder,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How [`SyncEngine::refresh`] treats a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Serve a fresh cached value without a remote call.
    IfStale,
    /// Always go to the remote (still joining an in-flight request).
    Force,
}

/// Cache and in-flight registry for one resource kind.
pub struct ResourceStore<V> {
    cache: TtlCache<CacheKey, V>,
    inflight: Coalescer<CacheKey, Cached<V>>,
}

impl<V> ResourceStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(kind: ResourceKind, policy: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: TtlCache::new(kind.as_str(), policy, clock),
            inflight: Coalescer::new(kind.as_str()),
        }
    }

    pub fn cache(&self) -> &TtlCache<CacheKey, V> {
        &self.cache
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.in_flight()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inflight.is_in_flight(key)
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) reader: DynChainReader,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retry: RetryScheduler,
    pub(crate) mirror: Option<PersistedMirror>,
    pub(crate) bus: InvalidationBus,

    pub(crate) positions: ResourceStore<PositionSnapshot>,
    pub(crate) margin: ResourceStore<MarginSnapshot>,
    pub(crate) orders: ResourceStore<OrderSnapshot>,
    pub(crate) order_book: ResourceStore<BookSnapshot>,
    pub(crate) market_prices: ResourceStore<RawMarketPrice>,

    pub(crate) position_builder: PositionSnapshotBuilder,
    pub(crate) margin_builder: MarginSummaryBuilder,
    pub(crate) order_builder: OrderSnapshotBuilder,
    pub(crate) book_builder: BookSnapshotBuilder,
}

/// Owner of every cache, in-flight registry and builder of a session.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    reader: DynChainReader,
    clock: Arc<dyn Clock>,
    mirror: Option<PersistedMirror>,
}

impl SyncEngineBuilder {
    /// Clock for fetch timestamps and freshness (default: system time).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirror user-scoped snapshots to a persisted store.
    pub fn mirror(mut self, mirror: PersistedMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        let Self {
            config,
            reader,
            clock,
            mirror,
        } = self;

        info!(
            network = %config.network,
            max_attempts = config.retry.max_attempts,
            persisted = mirror.is_some(),
            "Sync engine created"
        );

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                retry: RetryScheduler::new(config.retry),
                bus: InvalidationBus::new(config.invalidation_capacity),
                position_builder: PositionSnapshotBuilder::new(Arc::clone(&clock)),
                margin_builder: MarginSummaryBuilder::new(Arc::clone(&clock)),
                order_builder: OrderSnapshotBuilder::new(Arc::clone(&clock)),
                book_builder: BookSnapshotBuilder::new(Arc::clone(&clock)),
                positions: ResourceStore::new(
                    ResourceKind::Positions,
                    config.positions.cache,
                    Arc::clone(&clock),
                ),
                margin: ResourceStore::new(
                    ResourceKind::MarginSummary,
                    config.margin.cache,
                    Arc::clone(&clock),
                ),
                orders: ResourceStore::new(
                    ResourceKind::Orders,
                    config.orders.cache,
                    Arc::clone(&clock),
                ),
                order_book: ResourceStore::new(
                    ResourceKind::OrderBook,
                    config.order_book.cache,
                    Arc::clone(&clock),
                ),
                market_prices: ResourceStore::new(
                    ResourceKind::MarketPrice,
                    config.market_price.cache,
                    Arc::clone(&clock),
                ),
                config,
                reader,
                clock,
                mirror,
            }),
        })
    }
}

impl SyncEngine {
    pub fn builder(config: EngineConfig, reader: DynChainReader) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            reader,
            clock: Arc::new(SystemClock),
            mirror: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn network(&self) -> NetworkId {
        self.inner.config.network
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn reader(&self) -> &DynChainReader {
        &self.inner.reader
    }

    pub fn retry(&self) -> &RetryScheduler {
        &self.inner.retry
    }

    /// Cache key of `scope` on this engine's network.
    pub fn key<R: Resource>(&self, scope: &R) -> CacheKey {
        scope.key(self.network())
    }

    /// Cached value for `scope`, fresh or stale; `None` when absent or too
    /// old to serve. Falls back to the persisted mirror on a memory miss.
    pub fn cached<R: Resource>(&self, scope: &R) -> Option<Cached<R::Snapshot>> {
        let key = self.key(scope);
        let store = R::store(self);
        if let Some(hit) = store.cache.get(&key) {
            return Some(hit);
        }
        self.hydrate::<R>(&key)
    }

    /// Refresh `scope` through its store's single flight.
    ///
    /// Concurrent refreshes of one key share one remote round trip and
    /// observe the same outcome. A retry-exhausted failure leaves the cache
    /// untouched, so [`SyncEngine::cached`] still serves the previous value.
    pub async fn refresh<R: Resource>(
        &self,
        scope: &R,
        mode: RefreshMode,
    ) -> SyncResult<Cached<R::Snapshot>> {
        if mode == RefreshMode::IfStale {
            if let Some(hit) = self.cached(scope).filter(Cached::is_fresh) {
                return Ok(hit);
            }
        }

        let key = self.key(scope);
        let engine = self.clone();
        let scope = scope.clone();
        let flight_key = key.clone();
        R::store(self)
            .inflight
            .fetch(key, move || engine.fetch_and_store(scope, flight_key))
            .await
    }

    /// Like [`SyncEngine::refresh`] in `IfStale` mode, but a failed refresh
    /// degrades to the cached value (marked stale) when one exists.
    pub async fn read<R: Resource>(&self, scope: &R) -> SyncResult<Cached<R::Snapshot>> {
        match self.refresh(scope, RefreshMode::IfStale).await {
            Ok(hit) => Ok(hit),
            Err(e) => match self.cached(scope) {
                Some(previous) => {
                    warn!(
                        key = %self.key(scope),
                        fetched_at = %previous.fetched_at,
                        error = %e,
                        "Refresh failed, serving cached value"
                    );
                    Ok(Cached {
                        state: Freshness::Stale,
                        ..previous
                    })
                }
                None => Err(e),
            },
        }
    }

    pub fn is_in_flight<R: Resource>(&self, scope: &R) -> bool {
        R::store(self).is_in_flight(&self.key(scope))
    }

    /// Publish an invalidation to every open scope. Returns the number of
    /// subscribers reached.
    pub fn invalidate(&self, event: InvalidationEvent) -> usize {
        self.inner.bus.publish(event)
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.bus.subscribe()
    }

    /// Drop every cached entry past its stale threshold.
    pub fn purge_expired(&self) -> usize {
        let inner = &self.inner;
        let purged = inner.positions.cache.purge_expired()
            + inner.margin.cache.purge_expired()
            + inner.orders.cache.purge_expired()
            + inner.order_book.cache.purge_expired()
            + inner.market_prices.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        purged
    }

    async fn fetch_and_store<R: Resource>(
        self,
        scope: R,
        key: CacheKey,
    ) -> SyncResult<Cached<R::Snapshot>> {
        let previous = self.cached(&scope).map(|c| c.value);
        let started = self.inner.clock.now();
        let snapshot = scope.load(self.clone(), previous).await?;

        let store = R::store(&self);
        match store.cache.put(key.clone(), snapshot.clone(), started) {
            WriteOutcome::Stored => {
                self.persist::<R>(&key, started, &snapshot).await;
                Ok(Cached {
                    value: snapshot,
                    fetched_at: started,
                    state: Freshness::Fresh,
                })
            }
            WriteOutcome::Superseded => Ok(store.cache.get(&key).unwrap_or(Cached {
                value: snapshot,
                fetched_at: started,
                state: Freshness::Fresh,
            })),
        }
    }

    fn hydrate<R: Resource>(&self, key: &CacheKey) -> Option<Cached<R::Snapshot>> {
        if !R::KIND.is_user_scoped() {
            return None;
        }
        let mirror = self.inner.mirror.as_ref()?;
        match mirror.load::<R::Snapshot>(key) {
            Ok(Some((value, fetched_at))) => {
                debug!(%key, %fetched_at, "Hydrated from persisted mirror");
                let store = R::store(self);
                store.cache.put(key.clone(), value, fetched_at);
                store.cache.get(key)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "Persisted mirror read failed");
                None
            }
        }
    }

    /// Write through to the mirror on the blocking pool.
    async fn persist<R: Resource>(
        &self,
        key: &CacheKey,
        fetched_at: DateTime<Utc>,
        value: &R::Snapshot,
    ) {
        if !R::KIND.is_user_scoped() {
            return;
        }
        let Some(mirror) = self.inner.mirror.clone() else {
            return;
        };
        let (key, value) = (key.clone(), value.clone());
        let write_key = key.clone();
        let written =
            tokio::task::spawn_blocking(move || mirror.save(&write_key, fetched_at, &value)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%key, error = %e, "Persisted mirror write failed"),
            Err(e) => warn!(%key, error = %e, "Persisted mirror write task failed"),
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("network", &self.inner.config.network)
            .field("persisted", &self.inner.mirror.is_some())
            .finish()
    }
}
