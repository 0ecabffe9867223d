//! Write forwarding.
//!
//! Writes go to the remote system unmodified and are never retried: a
//! duplicated order is worse than a failed one. Once a receipt confirms the
//! write, every scope that could observe its effect is invalidated.

use crate::engine::SyncEngine;
use crate::events::{InvalidationEvent, InvalidationReason};
use perpsync_core::{
    FixedPoint, MarketId, OrderId, OrderSide, ResourceKind, SyncError, SyncResult, UserAddress,
};
use perpsync_remote::{DynChainWriter, TxReceipt, WriteIntent};
use perpsync_telemetry::Metrics;
use tracing::{debug, info, warn};

/// Forwards write intents and invalidates what they touch.
#[derive(Clone)]
pub struct WriteForwarder {
    engine: SyncEngine,
    writer: DynChainWriter,
}

impl WriteForwarder {
    pub fn new(engine: SyncEngine, writer: DynChainWriter) -> Self {
        Self { engine, writer }
    }

    /// Submit `intent` on behalf of `user` and wait for its receipt.
    ///
    /// A reverted transaction is reported as [`SyncError::WriteRejected`].
    pub async fn forward(&self, user: &UserAddress, intent: WriteIntent) -> SyncResult<TxReceipt> {
        let method = intent.method();
        let touches_orders = intent.touches_orders();
        debug!(%user, method, "Forwarding write");

        let pending = match self.writer.submit(user.clone(), intent).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(%user, method, error = %e, "Write submission failed");
                Metrics::write_outcome(method, e.kind());
                return Err(e);
            }
        };

        let receipt = match self.writer.confirm(pending.clone()).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(%user, method, tx = %pending, error = %e, "Write confirmation failed");
                Metrics::write_outcome(method, e.kind());
                return Err(e);
            }
        };

        if !receipt.is_confirmed() {
            warn!(%user, method, tx = %receipt.hash, "Write reverted");
            Metrics::write_outcome(method, "reverted");
            return Err(SyncError::WriteRejected(format!(
                "{method} transaction {} reverted",
                receipt.hash
            )));
        }

        Metrics::write_outcome(method, "confirmed");
        let reached = self.invalidate_after(user, &receipt, touches_orders);
        info!(%user, method, tx = %receipt.hash, scopes = reached, "Write confirmed");
        Ok(receipt)
    }

    pub async fn place_market_order(
        &self,
        user: &UserAddress,
        market_id: MarketId,
        side: OrderSide,
        size: FixedPoint,
    ) -> SyncResult<TxReceipt> {
        self.forward(
            user,
            WriteIntent::PlaceMarketOrder {
                market_id,
                side,
                size,
            },
        )
        .await
    }

    pub async fn place_limit_order(
        &self,
        user: &UserAddress,
        market_id: MarketId,
        side: OrderSide,
        price: FixedPoint,
        size: FixedPoint,
    ) -> SyncResult<TxReceipt> {
        self.forward(
            user,
            WriteIntent::PlaceLimitOrder {
                market_id,
                side,
                price,
                size,
            },
        )
        .await
    }

    pub async fn cancel_order(&self, user: &UserAddress, order_id: OrderId) -> SyncResult<TxReceipt> {
        self.forward(user, WriteIntent::CancelOrder { order_id }).await
    }

    pub async fn deposit(&self, user: &UserAddress, amount: FixedPoint) -> SyncResult<TxReceipt> {
        self.forward(user, WriteIntent::DepositCollateral { amount })
            .await
    }

    pub async fn withdraw(&self, user: &UserAddress, amount: FixedPoint) -> SyncResult<TxReceipt> {
        self.forward(user, WriteIntent::WithdrawCollateral { amount })
            .await
    }

    /// Publish invalidations for the user's scopes (and the book for order
    /// writes). Returns the total deliveries.
    fn invalidate_after(&self, user: &UserAddress, receipt: &TxReceipt, touches_orders: bool) -> usize {
        let reason = InvalidationReason::WriteConfirmed {
            tx: receipt.hash.clone(),
        };
        let mut events: Vec<InvalidationEvent> = [
            ResourceKind::Positions,
            ResourceKind::MarginSummary,
            ResourceKind::Orders,
        ]
        .into_iter()
        .map(|kind| InvalidationEvent::for_user(kind, user.clone(), reason.clone()))
        .collect();
        if touches_orders {
            events.push(InvalidationEvent::all(ResourceKind::OrderBook, reason));
        }
        events
            .into_iter()
            .map(|event| self.engine.invalidate(event))
            .sum()
    }
}

impl std::fmt::Debug for WriteForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteForwarder")
            .field("engine", &self.engine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use perpsync_core::Scale;
    use perpsync_remote::{MockChain, TxStatus};
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    fn user() -> UserAddress {
        "0x00000000000000000000000000000000000000bb".parse().unwrap()
    }

    fn setup() -> (Arc<MockChain>, WriteForwarder) {
        let chain = Arc::new(MockChain::new());
        let engine = SyncEngine::builder(EngineConfig::default(), chain.clone())
            .build()
            .unwrap();
        (chain.clone(), WriteForwarder::new(engine, chain))
    }

    #[tokio::test]
    async fn test_confirmed_order_invalidates_user_scopes_and_book() {
        let (chain, forwarder) = setup();
        let mut events = forwarder.engine.subscribe_invalidations();

        let receipt = forwarder
            .place_market_order(
                &user(),
                MarketId::new("eth-usd").unwrap(),
                OrderSide::Buy,
                FixedPoint::new(1_000_000_000_000_000_000, Scale::WAD),
            )
            .await
            .unwrap();
        assert!(receipt.is_confirmed());
        assert_eq!(chain.submitted().len(), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.resource);
        }
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Positions,
                ResourceKind::MarginSummary,
                ResourceKind::Orders,
                ResourceKind::OrderBook,
            ]
        );
    }

    #[tokio::test]
    async fn test_deposit_leaves_book_alone() {
        let (_chain, forwarder) = setup();
        let mut events = forwarder.engine.subscribe_invalidations();

        forwarder
            .deposit(&user(), FixedPoint::new(5_000_000, Scale::USD))
            .await
            .unwrap();

        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.resource, ResourceKind::OrderBook);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_reverted_write_is_rejected_without_invalidation() {
        let (chain, forwarder) = setup();
        chain.set_write_status(TxStatus::Failed);
        let mut events = forwarder.engine.subscribe_invalidations();

        let err = forwarder
            .cancel_order(&user(), OrderId(7))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected(_)));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_submission_failure_is_not_retried() {
        let (chain, forwarder) = setup();
        chain.fail_next(
            "withdrawCollateral",
            1,
            SyncError::TransientNetwork("reset".into()),
        );

        let err = forwarder
            .withdraw(&user(), FixedPoint::new(1_000_000, Scale::USD))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
        assert_eq!(chain.calls("withdrawCollateral"), 1);
        assert!(chain.submitted().is_empty());
    }
}
