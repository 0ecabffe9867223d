//! Core domain types for the perpsync engine.
//!
//! This crate provides the fundamental types shared by every other crate:
//! - `FixedPoint`, `Scale`: integer-encoded decimals as read from chain
//! - `Position`, `MarginAccount`, `Order`: display-ready records
//! - `Raw*` tuples: the shapes returned by the remote view functions
//! - `CacheKey`, `ResourceKind`: identities for cached and in-flight reads
//! - `SyncError`: the error taxonomy used across the engine

pub mod clock;
pub mod error;
pub mod fixed;
pub mod key;
pub mod margin;
pub mod market;
pub mod order;
pub mod position;
pub mod raw;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result, SyncError, SyncResult};
pub use fixed::{FixedPoint, Scale};
pub use key::{CacheKey, ResourceKind, SCHEMA_VERSION};
pub use margin::MarginAccount;
pub use market::{MarketId, NetworkId, UserAddress};
pub use order::{Order, OrderId, OrderSide, OrderStatus};
pub use position::{Position, PositionSide};
pub use raw::{
    RawBestPrices, RawDepth, RawLevel, RawLiquidation, RawMarginSummary, RawMarketPrice,
    RawOrder, RawPosition,
};
