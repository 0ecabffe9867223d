//! Open leveraged position record.

use crate::fixed::FixedPoint;
use crate::market::MarketId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a position, decoded from the sign of the on-chain size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// `None` for a zero size (no position).
    pub fn from_signed_size(signed_size: i128) -> Option<Self> {
        match signed_size.signum() {
            1 => Some(Self::Long),
            -1 => Some(Self::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> i128 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// One open position for a user in one market.
///
/// Built fresh on every refresh and never mutated afterwards.
/// `size_abs` is always non-zero for positions handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: MarketId,
    pub side: PositionSide,
    /// Unsigned quantity, 18 decimals.
    pub size_abs: FixedPoint,
    /// 6 decimals.
    pub entry_price: FixedPoint,
    /// 6 decimals.
    pub margin_locked: FixedPoint,
    /// 6 decimals. Falls back to `entry_price` when no market price is available.
    pub mark_price: FixedPoint,
    /// Whether `mark_price` came from the market price feed.
    pub mark_price_live: bool,
    /// 18 decimals, signed.
    pub unrealized_pnl: FixedPoint,
    /// Percent of entry notional, 4 dp.
    pub unrealized_pnl_percent: Decimal,
    /// 6 decimals. Absent when the remote lookup failed or reported no position.
    pub liquidation_price: Option<FixedPoint>,
    pub leverage: u32,
    pub is_under_liquidation: bool,
    pub last_refreshed_at: DateTime<Utc>,
}

impl Position {
    /// Signed size (positive long, negative short), 18 decimals.
    pub fn signed_size(&self) -> FixedPoint {
        FixedPoint::new(self.size_abs.raw() * self.side.sign(), self.size_abs.scale())
    }

    /// Entry notional (price x size), 24 decimals.
    pub fn entry_notional(&self) -> Option<FixedPoint> {
        self.entry_price.checked_mul(self.size_abs)
    }

    pub fn is_long(&self) -> bool {
        self.side == PositionSide::Long
    }

    /// Content equality ignoring the refresh timestamp.
    pub fn same_content(&self, other: &Position) -> bool {
        Position {
            last_refreshed_at: other.last_refreshed_at,
            ..self.clone()
        } == *other
    }
}
