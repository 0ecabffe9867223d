//! Push-style invalidation.
//!
//! Anything that learns the remote state moved (an observed chain event, a
//! confirmed write, an operator) publishes an [`InvalidationEvent`]. Every
//! open scope whose key the event matches schedules a forced refresh.

use perpsync_core::{CacheKey, MarketId, ResourceKind, UserAddress};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Which keys of a resource an event applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    User(UserAddress),
    Market(MarketId),
    /// Every key of the resource.
    All,
}

/// Why the remote state is believed to have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// An on-chain event was observed (e.g. `OrderFilled`).
    ChainEvent(String),
    /// A forwarded write was confirmed.
    WriteConfirmed { tx: String },
    Manual,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChainEvent(name) => write!(f, "chain event {name}"),
            Self::WriteConfirmed { tx } => write!(f, "write {tx} confirmed"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub resource: ResourceKind,
    pub target: InvalidationTarget,
    pub reason: InvalidationReason,
}

impl InvalidationEvent {
    pub fn for_user(resource: ResourceKind, user: UserAddress, reason: InvalidationReason) -> Self {
        Self {
            resource,
            target: InvalidationTarget::User(user),
            reason,
        }
    }

    pub fn for_market(market: MarketId, reason: InvalidationReason) -> Self {
        Self {
            resource: ResourceKind::MarketPrice,
            target: InvalidationTarget::Market(market),
            reason,
        }
    }

    pub fn all(resource: ResourceKind, reason: InvalidationReason) -> Self {
        Self {
            resource,
            target: InvalidationTarget::All,
            reason,
        }
    }

    /// Whether the event covers `key`. Events never cross resources or users.
    pub fn matches(&self, key: &CacheKey) -> bool {
        if key.resource != self.resource {
            return false;
        }
        match &self.target {
            InvalidationTarget::User(user) => key.identity == user.as_str(),
            InvalidationTarget::Market(market) => key.identity == market.as_str(),
            InvalidationTarget::All => true,
        }
    }
}

/// Fan-out of invalidation events to every open scope.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish `event`; returns how many subscribers received it.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        trace!(resource = %event.resource, reason = %event.reason, "Publishing invalidation");
        // No subscribers is not an error: nothing is open for that key.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::NetworkId;

    fn user(n: u8) -> UserAddress {
        format!("0x{:040x}", n).parse().unwrap()
    }

    #[test]
    fn test_matches_only_same_user_and_resource() {
        let network = NetworkId::new(1);
        let event =
            InvalidationEvent::for_user(ResourceKind::Positions, user(1), InvalidationReason::Manual);

        assert!(event.matches(&CacheKey::for_user(ResourceKind::Positions, network, &user(1))));
        assert!(!event.matches(&CacheKey::for_user(ResourceKind::Positions, network, &user(2))));
        assert!(!event.matches(&CacheKey::for_user(
            ResourceKind::MarginSummary,
            network,
            &user(1)
        )));
    }

    #[test]
    fn test_all_target_matches_every_key_of_resource() {
        let event = InvalidationEvent::all(
            ResourceKind::OrderBook,
            InvalidationReason::ChainEvent("OrderPlaced".into()),
        );
        let key = CacheKey::global(ResourceKind::OrderBook, NetworkId::new(1)).with_params("10");
        assert!(event.matches(&key));
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = InvalidationBus::new(4);
        assert_eq!(
            bus.publish(InvalidationEvent::all(
                ResourceKind::Orders,
                InvalidationReason::Manual
            )),
            0
        );

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let event = InvalidationEvent::for_market(
            MarketId::new("eth-usd").unwrap(),
            InvalidationReason::Manual,
        );
        assert_eq!(bus.publish(event.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }
}
