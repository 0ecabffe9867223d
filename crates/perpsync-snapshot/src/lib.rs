//! Snapshot builders for the perpsync engine.
//!
//! Each builder turns raw integer-encoded remote tuples into an immutable,
//! display-ready snapshot. A snapshot is built completely before it replaces
//! its predecessor, and carries a revision that only moves when the content
//! (timestamps aside) changed.
//!
//! - [`PositionSnapshotBuilder`]: positions with P&L, leverage, liquidation
//! - [`MarginSummaryBuilder`]: margin account with the available-balance guard
//! - [`OrderSnapshotBuilder`]: orders with fill-reconciled status
//! - [`BookSnapshotBuilder`]: best prices, depth, spread and mid

pub mod book;
pub mod margin;
pub mod orders;
pub mod position;

pub use book::{BookLevel, BookSnapshot, BookSnapshotBuilder};
pub use margin::{MarginSnapshot, MarginSummaryBuilder};
pub use orders::{OrderRecord, OrderSnapshot, OrderSnapshotBuilder};
pub use position::{MarketContext, MarketLookup, PositionSnapshot, PositionSnapshotBuilder};

/// Revision for a freshly built snapshot.
///
/// Starts at 1; unchanged content keeps the previous revision.
pub(crate) fn next_revision(previous: Option<u64>, unchanged: bool) -> u64 {
    match previous {
        None => 1,
        Some(rev) if unchanged => rev,
        Some(rev) => rev.saturating_add(1),
    }
}
