//! Shared fixtures for the sync engine integration tests.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use perpsync_cache::PersistedMirror;
use perpsync_core::{
    ManualClock, MarketId, NetworkId, OrderId, OrderStatus, RawLiquidation, RawMarginSummary,
    RawMarketPrice, RawOrder, RawPosition, UserAddress,
};
use perpsync_remote::{MockChain, RetryPolicy};
use perpsync_sync::{EngineConfig, SyncEngine};
use std::sync::Arc;
use std::time::Duration;

pub const NETWORK: NetworkId = NetworkId::new(42161);

pub const WAD: i128 = 1_000_000_000_000_000_000;
pub const USD: i128 = 1_000_000;

pub fn user(n: u8) -> UserAddress {
    format!("0x{:040x}", n).parse().unwrap()
}

pub fn market(id: &str) -> MarketId {
    MarketId::new(id).unwrap()
}

/// Three attempts, 10ms apart, no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
        .without_jitter()
        .with_attempt_timeout(Duration::from_secs(1))
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
        .with_network(NETWORK)
        .with_retry(fast_retry())
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
}

/// Engine wired to a scripted chain and a manual clock.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub clock: Arc<ManualClock>,
    pub engine: SyncEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(config(), None, Arc::new(ManualClock::new(start_time())))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None, Arc::new(ManualClock::new(start_time())))
    }

    pub fn build(config: EngineConfig, mirror: Option<PersistedMirror>, clock: Arc<ManualClock>) -> Self {
        Self::on_chain(Arc::new(MockChain::new()), config, mirror, clock)
    }

    pub fn on_chain(
        chain: Arc<MockChain>,
        config: EngineConfig,
        mirror: Option<PersistedMirror>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let mut builder = SyncEngine::builder(config, chain.clone()).clock(clock.clone());
        if let Some(mirror) = mirror {
            builder = builder.mirror(mirror);
        }
        let engine = builder.build().unwrap();
        Self {
            chain,
            clock,
            engine,
        }
    }

    /// Move the cache clock past the positions TTL.
    pub fn expire(&self) {
        self.clock.advance(Duration::from_secs(11));
    }
}

pub fn long_position(market_id: &str, size: i128, entry: i128, margin: i128) -> RawPosition {
    RawPosition {
        market_id: market(market_id),
        signed_size: size * WAD,
        entry_price: entry * USD,
        margin_locked: margin * USD,
        liquidation_price: None,
    }
}

pub fn price(mark: i128) -> RawMarketPrice {
    RawMarketPrice {
        mark_price: mark * USD,
        index_price: mark * USD,
        funding_rate: 0,
    }
}

pub fn margin_summary(total: i128, used: i128) -> RawMarginSummary {
    RawMarginSummary {
        total_collateral: total * USD,
        margin_used: used * USD,
        margin_reserved: 0,
        available_collateral: (total - used) * USD,
        realized_pnl: 0,
        unrealized_pnl: 0,
        socialized_loss: None,
        is_healthy: true,
    }
}

pub fn limit_order(id: u64, trader: &UserAddress, price: i128, size: i128, created_at: i64) -> RawOrder {
    RawOrder {
        id: OrderId(id),
        trader: trader.clone(),
        is_buy: true,
        price: Some(price * USD),
        size: size * WAD,
        status: OrderStatus::Pending,
        created_at,
    }
}

/// 2 ETH long at 2000 with 400 margin, marked at 2100, liquidation at 1700.
pub fn seed_user(chain: &MockChain, who: &UserAddress) {
    let eth = market("eth-usd");
    chain.set_positions(who, vec![long_position("eth-usd", 2, 2000, 400)]);
    chain.set_price(&eth, price(2100));
    chain.set_liquidation(
        who,
        &eth,
        RawLiquidation {
            liquidation_price: Some(1700 * USD),
            is_under_liquidation: false,
        },
    );
    chain.set_margin(who, margin_summary(10_000, 400));
}
