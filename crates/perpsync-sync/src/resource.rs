//! Resource scopes and how each is loaded.
//!
//! A scope names one cached resource: a user's positions, margin account or
//! orders, the order book at a given depth, or one market's price data. Its
//! `load` performs the remote reads (each through the retry scheduler) and
//! the snapshot build; the engine wraps it in the store's single flight.

use crate::engine::{ResourceStore, SyncEngine};
use futures_util::future::join_all;
use perpsync_core::{
    CacheKey, MarketId, NetworkId, OrderId, RawMarketPrice, RawPosition, ResourceKind,
    SyncError, SyncResult, UserAddress,
};
use perpsync_remote::{ops, BoxFuture};
use perpsync_snapshot::{
    BookSnapshot, MarginSnapshot, MarketContext, OrderRecord, OrderSnapshot, PositionSnapshot,
};
use perpsync_telemetry::Metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// Concurrent per-order reads within one orders refresh.
const ORDER_FETCH_CONCURRENCY: usize = 8;

/// A cacheable, refreshable resource scope.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    type Snapshot: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    const KIND: ResourceKind;

    fn key(&self, network: NetworkId) -> CacheKey;

    /// The engine store holding this resource.
    fn store(engine: &SyncEngine) -> &ResourceStore<Self::Snapshot>;

    /// Fetch and build a new snapshot. `previous` is the last cached one,
    /// used for revision tracking.
    fn load(
        self,
        engine: SyncEngine,
        previous: Option<Self::Snapshot>,
    ) -> BoxFuture<'static, SyncResult<Self::Snapshot>>;
}

// ============================================================================
// Positions
// ============================================================================

/// A user's open positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Positions {
    pub user: UserAddress,
}

impl Positions {
    pub fn new(user: UserAddress) -> Self {
        Self { user }
    }
}

impl Resource for Positions {
    type Snapshot = PositionSnapshot;

    const KIND: ResourceKind = ResourceKind::Positions;

    fn key(&self, network: NetworkId) -> CacheKey {
        CacheKey::for_user(Self::KIND, network, &self.user)
    }

    fn store(engine: &SyncEngine) -> &ResourceStore<PositionSnapshot> {
        &engine.inner.positions
    }

    fn load(
        self,
        engine: SyncEngine,
        previous: Option<PositionSnapshot>,
    ) -> BoxFuture<'static, SyncResult<PositionSnapshot>> {
        Box::pin(async move {
            let reader = engine.reader();
            let raw = engine
                .retry()
                .run(ops::USER_POSITIONS, || reader.user_positions(self.user.clone()))
                .await?;
            let context = market_context(&engine, &self.user, &raw).await;
            Ok(engine
                .inner
                .position_builder
                .build(&raw, &context, previous.as_ref()))
        })
    }
}

/// Resolve mark prices and liquidation data for every market the user holds.
///
/// Prices come from the shared market price store. Either lookup failing
/// only drops that piece of data; the builder falls back per field.
async fn market_context(
    engine: &SyncEngine,
    user: &UserAddress,
    raw: &[RawPosition],
) -> MarketContext {
    let markets: BTreeSet<&MarketId> = raw
        .iter()
        .filter(|p| p.signed_size != 0)
        .map(|p| &p.market_id)
        .collect();

    let lookups = markets.into_iter().map(|market| async move {
        let price_scope = MarketPrice::new(market.clone());
        let price = engine.read(&price_scope);
        let liquidation = engine.retry().run(ops::LIQUIDATION, || {
            engine.reader().liquidation(user.clone(), market.clone())
        });
        let (price, liquidation) = tokio::join!(price, liquidation);
        (market, price, liquidation)
    });

    let mut context = MarketContext::new();
    for (market, price, liquidation) in join_all(lookups).await {
        match price {
            Ok(cached) => context.insert_price(market.clone(), cached.value),
            Err(e) => warn!(
                %market,
                error = %e,
                "Mark price unavailable, falling back to entry price"
            ),
        }
        match liquidation {
            Ok(liq) => context.insert_liquidation(market.clone(), liq),
            Err(e) => warn!(
                %market,
                %user,
                error = %e,
                "Liquidation lookup failed, omitting field"
            ),
        }
    }
    context
}

// ============================================================================
// Margin
// ============================================================================

/// A user's unified margin account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Margin {
    pub user: UserAddress,
}

impl Margin {
    pub fn new(user: UserAddress) -> Self {
        Self { user }
    }
}

impl Resource for Margin {
    type Snapshot = MarginSnapshot;

    const KIND: ResourceKind = ResourceKind::MarginSummary;

    fn key(&self, network: NetworkId) -> CacheKey {
        CacheKey::for_user(Self::KIND, network, &self.user)
    }

    fn store(engine: &SyncEngine) -> &ResourceStore<MarginSnapshot> {
        &engine.inner.margin
    }

    fn load(
        self,
        engine: SyncEngine,
        previous: Option<MarginSnapshot>,
    ) -> BoxFuture<'static, SyncResult<MarginSnapshot>> {
        Box::pin(async move {
            let reader = engine.reader();
            let raw = engine
                .retry()
                .run(ops::MARGIN_SUMMARY, || reader.margin_summary(self.user.clone()))
                .await?;
            Ok(engine.inner.margin_builder.build(&raw, previous.as_ref()))
        })
    }
}

// ============================================================================
// Orders
// ============================================================================

/// A user's orders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Orders {
    pub user: UserAddress,
}

impl Orders {
    pub fn new(user: UserAddress) -> Self {
        Self { user }
    }
}

impl Resource for Orders {
    type Snapshot = OrderSnapshot;

    const KIND: ResourceKind = ResourceKind::Orders;

    fn key(&self, network: NetworkId) -> CacheKey {
        CacheKey::for_user(Self::KIND, network, &self.user)
    }

    fn store(engine: &SyncEngine) -> &ResourceStore<OrderSnapshot> {
        &engine.inner.orders
    }

    fn load(
        self,
        engine: SyncEngine,
        previous: Option<OrderSnapshot>,
    ) -> BoxFuture<'static, SyncResult<OrderSnapshot>> {
        Box::pin(async move {
            let reader = engine.reader();
            let ids = engine
                .retry()
                .run(ops::USER_ORDERS, || reader.user_orders(self.user.clone()))
                .await?;

            let mut records = Vec::with_capacity(ids.len());
            for chunk in ids.chunks(ORDER_FETCH_CONCURRENCY) {
                let fetched = join_all(chunk.iter().map(|&id| fetch_order(&engine, id))).await;
                for result in fetched {
                    if let Some(record) = result? {
                        records.push(record);
                    }
                }
            }
            Ok(engine
                .inner
                .order_builder
                .build(&records, previous.as_ref()))
        })
    }
}

/// One order and its filled amount. A malformed order is skipped
/// (`Ok(None)`); exhausted retries fail the whole refresh.
async fn fetch_order(engine: &SyncEngine, id: OrderId) -> SyncResult<Option<OrderRecord>> {
    let reader = engine.reader();
    let retry = engine.retry();
    let (order, filled) = tokio::join!(
        retry.run(ops::ORDER, || reader.order(id)),
        retry.run(ops::FILLED_AMOUNT, || reader.filled_amount(id)),
    );
    match (order, filled) {
        (Ok(order), Ok(filled)) => Ok(Some(OrderRecord { order, filled })),
        (Err(e), _) | (_, Err(e)) => {
            if matches!(e.root_cause(), SyncError::Decode(_)) {
                warn!(order = %id, error = %e, "Skipping undecodable order");
                Metrics::decode_skipped("orders");
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

// ============================================================================
// OrderBook
// ============================================================================

/// Top of book plus `levels` of depth per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderBook {
    pub levels: u32,
}

impl OrderBook {
    pub fn new(levels: u32) -> Self {
        Self { levels }
    }
}

impl Resource for OrderBook {
    type Snapshot = BookSnapshot;

    const KIND: ResourceKind = ResourceKind::OrderBook;

    fn key(&self, network: NetworkId) -> CacheKey {
        CacheKey::global(Self::KIND, network).with_params(self.levels.to_string())
    }

    fn store(engine: &SyncEngine) -> &ResourceStore<BookSnapshot> {
        &engine.inner.order_book
    }

    fn load(
        self,
        engine: SyncEngine,
        previous: Option<BookSnapshot>,
    ) -> BoxFuture<'static, SyncResult<BookSnapshot>> {
        Box::pin(async move {
            let reader = engine.reader();
            let retry = engine.retry();
            let (best, depth) = tokio::try_join!(
                retry.run(ops::BEST_PRICES, || reader.best_prices()),
                retry.run(ops::BOOK_DEPTH, || reader.book_depth(self.levels)),
            )?;
            Ok(engine
                .inner
                .book_builder
                .build(&best, &depth, previous.as_ref()))
        })
    }
}

// ============================================================================
// MarketPrice
// ============================================================================

/// Mark, index and funding of one market, shared by every user's positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketPrice {
    pub market: MarketId,
}

impl MarketPrice {
    pub fn new(market: MarketId) -> Self {
        Self { market }
    }
}

impl Resource for MarketPrice {
    type Snapshot = RawMarketPrice;

    const KIND: ResourceKind = ResourceKind::MarketPrice;

    fn key(&self, network: NetworkId) -> CacheKey {
        CacheKey::for_market(network, &self.market)
    }

    fn store(engine: &SyncEngine) -> &ResourceStore<RawMarketPrice> {
        &engine.inner.market_prices
    }

    fn load(
        self,
        engine: SyncEngine,
        _previous: Option<RawMarketPrice>,
    ) -> BoxFuture<'static, SyncResult<RawMarketPrice>> {
        Box::pin(async move {
            let reader = engine.reader();
            let price = engine
                .retry()
                .run(ops::MARKET_PRICE, || reader.market_price(self.market.clone()))
                .await?;
            debug!(market = %self.market, mark = price.mark_price, "Market price loaded");
            Ok(price)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserAddress {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[test]
    fn test_keys_are_scoped() {
        let network = NetworkId::new(42161);
        assert_eq!(
            Positions::new(user()).key(network).to_string(),
            "positions:v1:42161:0x00000000000000000000000000000000000000aa"
        );
        assert_eq!(
            Margin::new(user()).key(network).to_string(),
            "margin-summary:v1:42161:0x00000000000000000000000000000000000000aa"
        );
        assert_eq!(
            OrderBook::new(20).key(network).to_string(),
            "order-book:v1:42161:*:20"
        );
        let market = MarketId::new("ETH-USD").unwrap();
        assert_eq!(
            MarketPrice::new(market).key(network).to_string(),
            "market-price:v1:42161:eth-usd"
        );
    }

    #[test]
    fn test_user_scoped_kinds() {
        assert!(Positions::KIND.is_user_scoped());
        assert!(Orders::KIND.is_user_scoped());
        assert!(!OrderBook::KIND.is_user_scoped());
        assert!(!MarketPrice::KIND.is_user_scoped());
    }
}
