//! Position snapshot derivation.
//!
//! For each raw tuple: the sign of the size gives the side, zero sizes are
//! dropped, the mark price comes from the market lookup (falling back to the
//! entry price), and P&L / leverage are computed on raw integers with the
//! combined scale applied once.
//!
//! ```text
//! pnl[24]      = (mark[6] - entry[6]) * signed_size[18]
//! notional[24] = entry[6] * |size|[18]
//! pnl %        = pnl / notional * 100        (0 when notional is 0)
//! leverage     = round(notional / margin[6])  (at least 1)
//! ```

use crate::next_revision;
use chrono::{DateTime, Utc};
use perpsync_core::{
    Clock, FixedPoint, MarketId, Position, PositionSide, RawLiquidation, RawMarketPrice,
    RawPosition, Scale, SyncError, SyncResult,
};
use perpsync_telemetry::Metrics;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const PNL_PERCENT_DP: u32 = 4;

/// Market data resolved before a build.
pub trait MarketLookup {
    /// Current mark price (6 decimals). `None` if unavailable.
    fn mark_price(&self, market: &MarketId) -> Option<FixedPoint>;

    /// Remote liquidation data for the user's position in `market`.
    /// `None` when the lookup failed.
    fn liquidation(&self, market: &MarketId) -> Option<RawLiquidation>;
}

/// Map-backed [`MarketLookup`].
#[derive(Debug, Clone, Default)]
pub struct MarketContext {
    prices: HashMap<MarketId, RawMarketPrice>,
    liquidations: HashMap<MarketId, RawLiquidation>,
}

impl MarketContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_price(&mut self, market: MarketId, price: RawMarketPrice) {
        self.prices.insert(market, price);
    }

    pub fn insert_liquidation(&mut self, market: MarketId, liquidation: RawLiquidation) {
        self.liquidations.insert(market, liquidation);
    }

    #[must_use]
    pub fn with_price(mut self, market: MarketId, price: RawMarketPrice) -> Self {
        self.insert_price(market, price);
        self
    }

    #[must_use]
    pub fn with_liquidation(mut self, market: MarketId, liquidation: RawLiquidation) -> Self {
        self.insert_liquidation(market, liquidation);
        self
    }
}

impl MarketLookup for MarketContext {
    fn mark_price(&self, market: &MarketId) -> Option<FixedPoint> {
        self.prices
            .get(market)
            .map(|p| FixedPoint::new(p.mark_price, Scale::USD))
    }

    fn liquidation(&self, market: &MarketId) -> Option<RawLiquidation> {
        self.liquidations.get(market).copied()
    }
}

/// Immutable set of a user's open positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Sorted by market id; every entry has a non-zero size.
    pub positions: Vec<Position>,
    pub revision: u64,
    pub built_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, market: &MarketId) -> Option<&Position> {
        self.positions.iter().find(|p| &p.market_id == market)
    }

    /// Sum of unrealized P&L, 18 decimals.
    pub fn total_unrealized_pnl(&self) -> FixedPoint {
        self.positions
            .iter()
            .fold(FixedPoint::zero(Scale::WAD), |acc, p| {
                acc.checked_add(p.unrealized_pnl).unwrap_or(acc)
            })
    }

    /// Sum of locked margin, 6 decimals.
    pub fn total_margin_locked(&self) -> FixedPoint {
        self.positions
            .iter()
            .fold(FixedPoint::zero(Scale::USD), |acc, p| {
                acc.checked_add(p.margin_locked).unwrap_or(acc)
            })
    }

    /// Content equality ignoring timestamps and revision.
    pub fn same_content(&self, other: &PositionSnapshot) -> bool {
        self.positions.len() == other.positions.len()
            && self
                .positions
                .iter()
                .zip(&other.positions)
                .all(|(a, b)| a.same_content(b))
    }
}

/// Builds [`PositionSnapshot`]s from raw remote tuples.
pub struct PositionSnapshotBuilder {
    clock: Arc<dyn Clock>,
}

impl PositionSnapshotBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Build a snapshot. Records that fail validation are skipped; the
    /// rest of the snapshot is unaffected.
    pub fn build(
        &self,
        raw: &[RawPosition],
        lookup: &dyn MarketLookup,
        previous: Option<&PositionSnapshot>,
    ) -> PositionSnapshot {
        let now = self.clock.now();
        let mut positions: Vec<Position> = raw
            .iter()
            .filter_map(|r| match derive_position(r, lookup, now) {
                Ok(position) => position,
                Err(e) => {
                    warn!(market = %r.market_id, error = %e, "Skipping position record");
                    Metrics::decode_skipped("positions");
                    None
                }
            })
            .collect();
        positions.sort_by(|a, b| a.market_id.cmp(&b.market_id));

        let mut snapshot = PositionSnapshot {
            positions,
            revision: 0,
            built_at: now,
        };
        let unchanged = previous.is_some_and(|p| p.same_content(&snapshot));
        snapshot.revision = next_revision(previous.map(|p| p.revision), unchanged);
        snapshot
    }
}

fn overflow(market: &MarketId, what: &str) -> SyncError {
    SyncError::Decode(format!("{market}: {what} overflows"))
}

/// Derive one position; `Ok(None)` for a zero-size (closed) entry.
fn derive_position(
    raw: &RawPosition,
    lookup: &dyn MarketLookup,
    now: DateTime<Utc>,
) -> SyncResult<Option<Position>> {
    let Some(side) = PositionSide::from_signed_size(raw.signed_size) else {
        return Ok(None);
    };
    let market = &raw.market_id;
    if raw.entry_price < 0 {
        return Err(SyncError::Decode(format!(
            "{market}: negative entry price {}",
            raw.entry_price
        )));
    }
    if raw.margin_locked < 0 {
        return Err(SyncError::Decode(format!(
            "{market}: negative margin {}",
            raw.margin_locked
        )));
    }

    let signed_size = FixedPoint::new(raw.signed_size, Scale::WAD);
    let size_abs = signed_size.abs();
    let entry_price = FixedPoint::new(raw.entry_price, Scale::USD);
    let margin_locked = FixedPoint::new(raw.margin_locked, Scale::USD);

    let (mark_price, mark_price_live) = match lookup.mark_price(market) {
        Some(mark) if mark.is_positive() => (mark, true),
        _ => {
            debug!(%market, "No mark price, using entry price");
            (entry_price, false)
        }
    };

    let pnl_notional = mark_price
        .checked_sub(entry_price)
        .and_then(|delta| delta.checked_mul(signed_size))
        .ok_or_else(|| overflow(market, "unrealized pnl"))?;
    let unrealized_pnl = pnl_notional
        .rescale(Scale::WAD)
        .ok_or_else(|| overflow(market, "unrealized pnl"))?;
    let entry_notional = entry_price
        .checked_mul(size_abs)
        .ok_or_else(|| overflow(market, "entry notional"))?;

    let unrealized_pnl_percent = (pnl_notional.ratio(entry_notional) * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(PNL_PERCENT_DP, RoundingStrategy::MidpointAwayFromZero);

    let leverage = match entry_notional.round_div_integer(margin_locked) {
        Some(ratio) => u32::try_from(ratio.max(1)).unwrap_or(u32::MAX),
        None => {
            debug!(%market, "Zero locked margin, reporting leverage 1");
            1
        }
    };

    let remote = lookup.liquidation(market);
    let liquidation_price = raw
        .liquidation_price
        .or_else(|| remote.and_then(|l| l.liquidation_price))
        // zero is how the remote reports "no position"
        .filter(|price| *price > 0)
        .map(|price| FixedPoint::new(price, Scale::USD));
    let is_under_liquidation = remote.is_some_and(|l| l.is_under_liquidation);

    Ok(Some(Position {
        market_id: market.clone(),
        side,
        size_abs,
        entry_price,
        margin_locked,
        mark_price,
        mark_price_live,
        unrealized_pnl,
        unrealized_pnl_percent,
        liquidation_price,
        leverage,
        is_under_liquidation,
        last_refreshed_at: now,
    }))
}
