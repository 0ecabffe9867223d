//! Raw tuples returned by the remote view functions.
//!
//! All numeric fields are integer-encoded (see [`crate::fixed`]) and travel as
//! decimal strings on the wire. Scales per field:
//! prices / collateral / margin = 6, sizes / P&L = 18.

use crate::fixed::int_string;
use crate::market::{MarketId, UserAddress};
use crate::order::{OrderId, OrderStatus};
use serde::{Deserialize, Serialize};

/// `getUserPositions(user)` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub market_id: MarketId,
    /// Positive long, negative short, 18 decimals.
    #[serde(with = "int_string")]
    pub signed_size: i128,
    #[serde(with = "int_string")]
    pub entry_price: i128,
    #[serde(with = "int_string")]
    pub margin_locked: i128,
    /// Present when the positions call already reports it.
    #[serde(default, with = "int_string::option")]
    pub liquidation_price: Option<i128>,
}

/// `getMarketPriceData(marketId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMarketPrice {
    #[serde(with = "int_string")]
    pub mark_price: i128,
    #[serde(with = "int_string")]
    pub index_price: i128,
    #[serde(with = "int_string")]
    pub funding_rate: i128,
}

/// `getLiquidationPrice(user, marketId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLiquidation {
    /// `None` when the remote reports no position.
    #[serde(default, with = "int_string::option")]
    pub liquidation_price: Option<i128>,
    #[serde(default)]
    pub is_under_liquidation: bool,
}

/// `getUnifiedMarginSummary(user)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMarginSummary {
    #[serde(with = "int_string")]
    pub total_collateral: i128,
    #[serde(with = "int_string")]
    pub margin_used: i128,
    #[serde(with = "int_string")]
    pub margin_reserved: i128,
    #[serde(with = "int_string")]
    pub available_collateral: i128,
    #[serde(with = "int_string")]
    pub realized_pnl: i128,
    #[serde(with = "int_string")]
    pub unrealized_pnl: i128,
    #[serde(default, with = "int_string::option")]
    pub socialized_loss: Option<i128>,
    pub is_healthy: bool,
}

/// `getOrder(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub id: OrderId,
    pub trader: UserAddress,
    pub is_buy: bool,
    /// Zero or absent for market orders.
    #[serde(default, with = "int_string::option")]
    pub price: Option<i128>,
    #[serde(with = "int_string")]
    pub size: i128,
    pub status: OrderStatus,
    /// Unix seconds.
    pub created_at: i64,
}

/// `getBestPrices()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBestPrices {
    #[serde(with = "int_string")]
    pub best_bid: i128,
    #[serde(with = "int_string")]
    pub best_ask: i128,
}

/// One aggregated book level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLevel {
    #[serde(with = "int_string")]
    pub price: i128,
    #[serde(with = "int_string")]
    pub size: i128,
}

/// `getOrderBookDepth(levels)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDepth {
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}
