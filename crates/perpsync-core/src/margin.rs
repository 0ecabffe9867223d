//! Per-user aggregate collateral state.

use crate::fixed::FixedPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Margin account summary as displayed to the user.
///
/// Collateral aggregates are taken from the remote tuple as-is; the engine
/// does not recompute `available = total - used - reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginAccount {
    /// 6 decimals.
    pub total_collateral: FixedPoint,
    /// 6 decimals, clamped at zero.
    pub available_collateral: FixedPoint,
    /// 6 decimals.
    pub margin_used: FixedPoint,
    /// 6 decimals.
    pub margin_reserved: FixedPoint,
    /// 18 decimals.
    pub realized_pnl: FixedPoint,
    /// 18 decimals.
    pub unrealized_pnl: FixedPoint,
    /// 6 decimals. Haircut applied during shortfall events.
    pub socialized_loss: FixedPoint,
    pub is_healthy: bool,
    pub last_refreshed_at: DateTime<Utc>,
}

impl MarginAccount {
    /// Share of total collateral in use (used + reserved), 0 when empty.
    pub fn utilization(&self) -> rust_decimal::Decimal {
        match self.margin_used.checked_add(self.margin_reserved) {
            Some(committed) => committed.ratio(self.total_collateral),
            None => rust_decimal::Decimal::ZERO,
        }
    }

    /// Content equality ignoring the refresh timestamp.
    pub fn same_content(&self, other: &MarginAccount) -> bool {
        MarginAccount {
            last_refreshed_at: other.last_refreshed_at,
            ..self.clone()
        } == *other
    }
}
