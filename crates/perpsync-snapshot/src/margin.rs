//! Margin account derivation.
//!
//! A unit conversion of the remote tuple. Collateral aggregates are trusted
//! as reported; the only local check is that the available balance is not
//! negative. A negative balance is clamped to zero for display and always
//! marks the account unhealthy, whatever the remote health bit says.

use crate::next_revision;
use chrono::{DateTime, Utc};
use perpsync_core::{Clock, FixedPoint, MarginAccount, RawMarginSummary, Scale};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Margin account with its revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginSnapshot {
    pub account: MarginAccount,
    pub revision: u64,
    pub built_at: DateTime<Utc>,
}

pub struct MarginSummaryBuilder {
    clock: Arc<dyn Clock>,
}

impl MarginSummaryBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Convert one remote summary.
    pub fn account(&self, raw: &RawMarginSummary) -> MarginAccount {
        let usd = |v: i128| FixedPoint::new(v, Scale::USD);
        let wad = |v: i128| FixedPoint::new(v, Scale::WAD);

        let negative_available = raw.available_collateral < 0;
        if negative_available {
            warn!(
                available = raw.available_collateral,
                total = raw.total_collateral,
                used = raw.margin_used,
                reserved = raw.margin_reserved,
                "Negative available collateral reported, flagging account unhealthy"
            );
        }

        MarginAccount {
            total_collateral: usd(raw.total_collateral),
            available_collateral: usd(raw.available_collateral.max(0)),
            margin_used: usd(raw.margin_used),
            margin_reserved: usd(raw.margin_reserved),
            realized_pnl: wad(raw.realized_pnl),
            unrealized_pnl: wad(raw.unrealized_pnl),
            socialized_loss: usd(raw.socialized_loss.unwrap_or(0)),
            is_healthy: raw.is_healthy && !negative_available,
            last_refreshed_at: self.clock.now(),
        }
    }

    /// Convert and assign a revision relative to `previous`.
    pub fn build(
        &self,
        raw: &RawMarginSummary,
        previous: Option<&MarginSnapshot>,
    ) -> MarginSnapshot {
        let account = self.account(raw);
        let unchanged = previous.is_some_and(|p| p.account.same_content(&account));
        MarginSnapshot {
            built_at: account.last_refreshed_at,
            account,
            revision: next_revision(previous.map(|p| p.revision), unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::ManualClock;
    use rust_decimal_macros::dec;

    fn raw() -> RawMarginSummary {
        RawMarginSummary {
            total_collateral: 10_000_000_000,
            margin_used: 2_500_000_000,
            margin_reserved: 500_000_000,
            available_collateral: 7_000_000_000,
            realized_pnl: 125_500_000_000_000_000_000,
            unrealized_pnl: -3_000_000_000_000_000_000,
            socialized_loss: None,
            is_healthy: true,
        }
    }

    fn builder() -> MarginSummaryBuilder {
        MarginSummaryBuilder::new(Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_unit_conversion() {
        let account = builder().account(&raw());
        assert_eq!(account.total_collateral.to_decimal(), dec!(10000));
        assert_eq!(account.available_collateral.to_decimal(), dec!(7000));
        assert_eq!(account.margin_used.to_decimal(), dec!(2500));
        assert_eq!(account.margin_reserved.to_decimal(), dec!(500));
        assert_eq!(account.realized_pnl.to_decimal(), dec!(125.5));
        assert_eq!(account.unrealized_pnl.to_decimal(), dec!(-3));
        assert!(account.socialized_loss.is_zero());
        assert!(account.is_healthy);
        assert_eq!(account.utilization(), dec!(0.3));
    }

    #[test]
    fn test_reported_aggregates_are_not_recomputed() {
        let mut inconsistent = raw();
        inconsistent.available_collateral = 1_000_000;
        let account = builder().account(&inconsistent);
        assert_eq!(account.available_collateral.to_decimal(), dec!(1));
    }

    #[test]
    fn test_negative_available_clamped_and_unhealthy() {
        let mut bad = raw();
        bad.available_collateral = -50_000_000;
        bad.is_healthy = true;
        let account = builder().account(&bad);
        assert!(account.available_collateral.is_zero());
        assert!(!account.is_healthy);
    }

    #[test]
    fn test_socialized_loss_reported() {
        let mut haircut = raw();
        haircut.socialized_loss = Some(12_340_000);
        let account = builder().account(&haircut);
        assert_eq!(account.socialized_loss.to_decimal(), dec!(12.34));
    }

    #[test]
    fn test_revision() {
        let b = builder();
        let first = b.build(&raw(), None);
        let second = b.build(&raw(), Some(&first));
        assert_eq!(second.revision, first.revision);

        let mut moved = raw();
        moved.unrealized_pnl = 0;
        let third = b.build(&moved, Some(&second));
        assert_eq!(third.revision, first.revision + 1);
    }
}
