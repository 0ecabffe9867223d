//! Resting and historical orders.

use crate::fixed::FixedPoint;
use crate::market::UserAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order book order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Reconcile the remote status with the filled amount.
    ///
    /// `Filled` iff `filled >= total`; `PartiallyFilled` iff `0 < filled < total`,
    /// whatever the remote reports. Only an unfilled order keeps a remote
    /// `Cancelled`/`Expired` status.
    pub fn derive(remote: OrderStatus, size_total: i128, size_filled: i128) -> Self {
        if size_total > 0 && size_filled >= size_total {
            return Self::Filled;
        }
        if size_filled > 0 {
            return Self::PartiallyFilled;
        }
        match remote {
            Self::Cancelled | Self::Expired => remote,
            _ => Self::Pending,
        }
    }

    /// Whether the order can still trade.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::PartiallyFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// A resting or historical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub trader: UserAddress,
    pub side: OrderSide,
    /// 6 decimals; `None` for market orders.
    pub price: Option<FixedPoint>,
    /// 18 decimals.
    pub size_total: FixedPoint,
    /// 18 decimals.
    pub size_filled: FixedPoint,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Unfilled remainder, never negative.
    pub fn size_remaining(&self) -> FixedPoint {
        let remaining = (self.size_total.raw() - self.size_filled.raw()).max(0);
        FixedPoint::new(remaining, self.size_total.scale())
    }

    pub fn is_market(&self) -> bool {
        self.price.is_none()
    }
}
