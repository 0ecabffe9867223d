//! Order snapshot derivation.

use crate::next_revision;
use chrono::{DateTime, Utc};
use perpsync_core::{
    Clock, FixedPoint, Order, OrderId, OrderSide, OrderStatus, RawOrder, Scale, SyncError,
    SyncResult,
};
use perpsync_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// One order as fetched: the order tuple plus its filled amount (18 decimals).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order: RawOrder,
    pub filled: i128,
}

/// A user's orders, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub orders: Vec<Order>,
    pub revision: u64,
    pub built_at: DateTime<Utc>,
}

impl OrderSnapshot {
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    /// Orders that can still trade.
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| o.status.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_orders().count()
    }
}

pub struct OrderSnapshotBuilder {
    clock: Arc<dyn Clock>,
}

impl OrderSnapshotBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn build(
        &self,
        records: &[OrderRecord],
        previous: Option<&OrderSnapshot>,
    ) -> OrderSnapshot {
        let mut orders: Vec<Order> = records
            .iter()
            .filter_map(|r| match derive_order(r) {
                Ok(order) => Some(order),
                Err(e) => {
                    warn!(order = %r.order.id, error = %e, "Skipping order record");
                    Metrics::decode_skipped("orders");
                    None
                }
            })
            .collect();
        orders.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let unchanged = previous.is_some_and(|p| p.orders == orders);
        OrderSnapshot {
            orders,
            revision: next_revision(previous.map(|p| p.revision), unchanged),
            built_at: self.clock.now(),
        }
    }
}

fn derive_order(record: &OrderRecord) -> SyncResult<Order> {
    let raw = &record.order;
    if raw.size <= 0 {
        return Err(SyncError::Decode(format!("non-positive size {}", raw.size)));
    }
    let price = match raw.price {
        // zero price marks a market order
        None | Some(0) => None,
        Some(p) if p > 0 => Some(FixedPoint::new(p, Scale::USD)),
        Some(p) => return Err(SyncError::Decode(format!("negative price {p}"))),
    };
    let created_at = DateTime::from_timestamp(raw.created_at, 0)
        .ok_or_else(|| SyncError::Decode(format!("invalid timestamp {}", raw.created_at)))?;
    let filled = record.filled.max(0);

    Ok(Order {
        id: raw.id,
        trader: raw.trader.clone(),
        side: if raw.is_buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        },
        price,
        size_total: FixedPoint::new(raw.size, Scale::WAD),
        size_filled: FixedPoint::new(filled, Scale::WAD),
        status: OrderStatus::derive(raw.status, raw.size, filled),
        created_at,
    })
}
