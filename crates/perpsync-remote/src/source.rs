//! Remote read/write seams.
//!
//! The engine treats the order book, margin vault and pricing oracle as one
//! opaque async data source returning integer-encoded tuples. Implementations
//! are injected as trait objects so the engine can be driven by the HTTP
//! gateway in production and by [`crate::MockChain`] in tests.

use perpsync_core::{
    FixedPoint, MarketId, OrderId, OrderSide, RawBestPrices, RawDepth, RawLiquidation,
    RawMarginSummary, RawMarketPrice, RawOrder, RawPosition, SyncResult, UserAddress,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Remote operation names, used as gateway methods and metric labels.
pub mod ops {
    pub const USER_POSITIONS: &str = "getUserPositions";
    pub const MARKET_PRICE: &str = "getMarketPriceData";
    pub const LIQUIDATION: &str = "getLiquidationPrice";
    pub const MARGIN_SUMMARY: &str = "getUnifiedMarginSummary";
    pub const USER_ORDERS: &str = "getUserOrders";
    pub const ORDER: &str = "getOrder";
    pub const FILLED_AMOUNT: &str = "getFilledAmount";
    pub const BEST_PRICES: &str = "getBestPrices";
    pub const BOOK_DEPTH: &str = "getOrderBookDepth";
    pub const TX_RECEIPT: &str = "getTransactionReceipt";
}

/// Read side of the remote system.
pub trait ChainReader: Send + Sync {
    fn user_positions(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<RawPosition>>>;

    fn market_price(&self, market: MarketId) -> BoxFuture<'_, SyncResult<RawMarketPrice>>;

    /// Per-position liquidation price and flag, computed remotely.
    fn liquidation(
        &self,
        user: UserAddress,
        market: MarketId,
    ) -> BoxFuture<'_, SyncResult<RawLiquidation>>;

    fn margin_summary(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<RawMarginSummary>>;

    fn user_orders(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<OrderId>>>;

    fn order(&self, id: OrderId) -> BoxFuture<'_, SyncResult<RawOrder>>;

    /// Filled size, 18 decimals.
    fn filled_amount(&self, id: OrderId) -> BoxFuture<'_, SyncResult<i128>>;

    fn best_prices(&self) -> BoxFuture<'_, SyncResult<RawBestPrices>>;

    fn book_depth(&self, levels: u32) -> BoxFuture<'_, SyncResult<RawDepth>>;
}

/// A write intent, forwarded to the remote system as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteIntent {
    PlaceMarketOrder {
        market_id: MarketId,
        side: OrderSide,
        /// 18 decimals.
        size: FixedPoint,
    },
    PlaceLimitOrder {
        market_id: MarketId,
        side: OrderSide,
        /// 6 decimals.
        price: FixedPoint,
        /// 18 decimals.
        size: FixedPoint,
    },
    CancelOrder {
        order_id: OrderId,
    },
    DepositCollateral {
        /// 6 decimals.
        amount: FixedPoint,
    },
    WithdrawCollateral {
        /// 6 decimals.
        amount: FixedPoint,
    },
}

impl WriteIntent {
    /// Gateway method / metric label.
    pub fn method(&self) -> &'static str {
        match self {
            Self::PlaceMarketOrder { .. } => "placeMarketOrder",
            Self::PlaceLimitOrder { .. } => "placeLimitOrder",
            Self::CancelOrder { .. } => "cancelOrder",
            Self::DepositCollateral { .. } => "depositCollateral",
            Self::WithdrawCollateral { .. } => "withdrawCollateral",
        }
    }

    /// Whether a confirmed write can change the user's orders.
    pub fn touches_orders(&self) -> bool {
        matches!(
            self,
            Self::PlaceMarketOrder { .. } | Self::PlaceLimitOrder { .. } | Self::CancelOrder { .. }
        )
    }
}

/// Opaque handle to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingTx {
    pub hash: String,
}

impl fmt::Display for PendingTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// Terminal transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
    pub status: TxStatus,
}

impl TxReceipt {
    pub fn is_confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }
}

/// Write side of the remote system. Signing happens behind this seam.
pub trait ChainWriter: Send + Sync {
    fn submit(&self, user: UserAddress, intent: WriteIntent)
        -> BoxFuture<'_, SyncResult<PendingTx>>;

    /// Wait for the transaction to reach a terminal state.
    fn confirm(&self, tx: PendingTx) -> BoxFuture<'_, SyncResult<TxReceipt>>;
}

/// Arc wrapper for ChainReader trait objects.
pub type DynChainReader = Arc<dyn ChainReader>;

/// Arc wrapper for ChainWriter trait objects.
pub type DynChainWriter = Arc<dyn ChainWriter>;

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::Scale;

    #[test]
    fn test_write_intent_classification() {
        let cancel = WriteIntent::CancelOrder {
            order_id: OrderId(1),
        };
        assert_eq!(cancel.method(), "cancelOrder");
        assert!(cancel.touches_orders());

        let deposit = WriteIntent::DepositCollateral {
            amount: FixedPoint::new(5_000_000, Scale::USD),
        };
        assert_eq!(deposit.method(), "depositCollateral");
        assert!(!deposit.touches_orders());
    }
}
