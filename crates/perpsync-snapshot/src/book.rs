//! Order book snapshot derivation.

use crate::next_revision;
use chrono::{DateTime, Utc};
use perpsync_core::{Clock, FixedPoint, RawBestPrices, RawDepth, RawLevel, Scale};
use perpsync_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mid price carries one extra decimal so halving a USD sum stays exact.
const MID_SCALE: Scale = Scale::new(7);

/// Aggregated liquidity at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// 6 decimals.
    pub price: FixedPoint,
    /// 18 decimals.
    pub size: FixedPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub best_bid: Option<FixedPoint>,
    pub best_ask: Option<FixedPoint>,
    /// Bids, best (highest) first.
    pub bids: Vec<BookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<BookLevel>,
    pub spread: Option<FixedPoint>,
    pub mid: Option<FixedPoint>,
    pub is_crossed: bool,
    pub revision: u64,
    pub built_at: DateTime<Utc>,
}

impl BookSnapshot {
    /// Equality ignoring revision and build time.
    pub fn same_content(&self, other: &BookSnapshot) -> bool {
        self.best_bid == other.best_bid
            && self.best_ask == other.best_ask
            && self.bids == other.bids
            && self.asks == other.asks
    }

    pub fn depth(&self) -> usize {
        self.bids.len().max(self.asks.len())
    }
}

pub struct BookSnapshotBuilder {
    clock: Arc<dyn Clock>,
}

impl BookSnapshotBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn build(
        &self,
        best: &RawBestPrices,
        depth: &RawDepth,
        previous: Option<&BookSnapshot>,
    ) -> BookSnapshot {
        let best_bid = price_or_absent(best.best_bid);
        let best_ask = price_or_absent(best.best_ask);

        let mut bids = levels("bid", &depth.bids);
        let mut asks = levels("ask", &depth.asks);
        bids.sort_by_key(|l| std::cmp::Reverse(l.price.raw()));
        asks.sort_by_key(|l| l.price.raw());

        let (spread, mid, is_crossed) = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                let crossed = bid.raw() >= ask.raw();
                if crossed {
                    debug!(bid = %bid, ask = %ask, "Crossed top of book");
                }
                (
                    ask.checked_sub(bid),
                    bid.raw()
                        .checked_add(ask.raw())
                        .and_then(|sum| sum.checked_mul(5))
                        .map(|raw| FixedPoint::new(raw, MID_SCALE)),
                    crossed,
                )
            }
            _ => (None, None, false),
        };

        let mut snapshot = BookSnapshot {
            best_bid,
            best_ask,
            bids,
            asks,
            spread,
            mid,
            is_crossed,
            revision: 0,
            built_at: self.clock.now(),
        };
        let unchanged = previous.is_some_and(|p| p.same_content(&snapshot));
        snapshot.revision = next_revision(previous.map(|p| p.revision), unchanged);
        snapshot
    }
}

fn price_or_absent(raw: i128) -> Option<FixedPoint> {
    (raw > 0).then(|| FixedPoint::new(raw, Scale::USD))
}

fn levels(side: &'static str, raw: &[RawLevel]) -> Vec<BookLevel> {
    raw.iter()
        .filter_map(|level| {
            if level.price <= 0 || level.size <= 0 {
                warn!(side, price = level.price, size = level.size, "Skipping book level");
                Metrics::decode_skipped("order-book");
                return None;
            }
            Some(BookLevel {
                price: FixedPoint::new(level.price, Scale::USD),
                size: FixedPoint::new(level.size, Scale::WAD),
            })
        })
        .collect()
}
