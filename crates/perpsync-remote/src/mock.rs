//! Scripted in-process chain.
//!
//! Serves whatever state the test (or a dry run) put into it, counts calls
//! per operation and injects failures on demand.

use crate::source::{
    ops, BoxFuture, ChainReader, ChainWriter, PendingTx, TxReceipt, TxStatus, WriteIntent,
};
use parking_lot::Mutex;
use perpsync_core::{
    MarketId, OrderId, RawBestPrices, RawDepth, RawLiquidation, RawMarginSummary,
    RawMarketPrice, RawOrder, RawPosition, SyncError, SyncResult, UserAddress,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Operation label for `confirm` calls.
pub const CONFIRM: &str = "confirm";

#[derive(Default)]
struct MockState {
    positions: HashMap<UserAddress, Vec<RawPosition>>,
    prices: HashMap<MarketId, RawMarketPrice>,
    liquidations: HashMap<(UserAddress, MarketId), RawLiquidation>,
    margins: HashMap<UserAddress, RawMarginSummary>,
    orders: HashMap<UserAddress, Vec<OrderId>>,
    order_records: HashMap<OrderId, RawOrder>,
    filled: HashMap<OrderId, i128>,
    best: Option<RawBestPrices>,
    depth: RawDepth,

    /// One-shot failures, consumed in order.
    failures: HashMap<&'static str, VecDeque<SyncError>>,
    /// Failures returned until cleared.
    persistent_failures: HashMap<&'static str, SyncError>,
    calls: HashMap<&'static str, usize>,

    submitted: Vec<(UserAddress, WriteIntent)>,
    write_status: Option<TxStatus>,
    reject_writes: Option<String>,
    next_tx: u64,
}

impl MockState {
    fn take_failure(&mut self, op: &str) -> Option<SyncError> {
        if let Some(err) = self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Some(err);
        }
        self.persistent_failures.get(op).cloned()
    }
}

/// In-process chain with scripted state.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
    latency: Mutex<Duration>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_positions(&self, user: &UserAddress, positions: Vec<RawPosition>) {
        self.state.lock().positions.insert(user.clone(), positions);
    }

    pub fn set_price(&self, market: &MarketId, price: RawMarketPrice) {
        self.state.lock().prices.insert(market.clone(), price);
    }

    pub fn remove_price(&self, market: &MarketId) {
        self.state.lock().prices.remove(market);
    }

    pub fn set_liquidation(&self, user: &UserAddress, market: &MarketId, liq: RawLiquidation) {
        self.state
            .lock()
            .liquidations
            .insert((user.clone(), market.clone()), liq);
    }

    pub fn set_margin(&self, user: &UserAddress, summary: RawMarginSummary) {
        self.state.lock().margins.insert(user.clone(), summary);
    }

    /// Add an order to its trader's list with the given filled size.
    pub fn add_order(&self, order: RawOrder, filled: i128) {
        let mut state = self.state.lock();
        state
            .orders
            .entry(order.trader.clone())
            .or_default()
            .push(order.id);
        state.filled.insert(order.id, filled);
        state.order_records.insert(order.id, order);
    }

    pub fn set_book(&self, best: RawBestPrices, depth: RawDepth) {
        let mut state = self.state.lock();
        state.best = Some(best);
        state.depth = depth;
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: &'static str, times: usize, error: SyncError) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail every call of `op` until [`MockChain::clear_failures`].
    pub fn fail_always(&self, op: &'static str, error: SyncError) {
        self.state.lock().persistent_failures.insert(op, error);
    }

    pub fn clear_failures(&self, op: &'static str) {
        let mut state = self.state.lock();
        state.failures.remove(op);
        state.persistent_failures.remove(op);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Calls of `op` so far, failed ones included.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Writes forwarded so far.
    pub fn submitted(&self) -> Vec<(UserAddress, WriteIntent)> {
        self.state.lock().submitted.clone()
    }

    /// Terminal status reported by `confirm` (default: confirmed).
    pub fn set_write_status(&self, status: TxStatus) {
        self.state.lock().write_status = Some(status);
    }

    /// Reject every submitted write with `reason`.
    pub fn reject_writes(&self, reason: impl Into<String>) {
        self.state.lock().reject_writes = Some(reason.into());
    }

    fn respond<T, F>(&self, op: &'static str, read: F) -> BoxFuture<'_, SyncResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut MockState) -> SyncResult<T> + Send + 'static,
    {
        Box::pin(async move {
            *self.state.lock().calls.entry(op).or_default() += 1;
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut state = self.state.lock();
            if let Some(err) = state.take_failure(op) {
                return Err(err);
            }
            read(&mut *state)
        })
    }
}

fn empty_margin() -> RawMarginSummary {
    RawMarginSummary {
        total_collateral: 0,
        margin_used: 0,
        margin_reserved: 0,
        available_collateral: 0,
        realized_pnl: 0,
        unrealized_pnl: 0,
        socialized_loss: None,
        is_healthy: true,
    }
}

impl ChainReader for MockChain {
    fn user_positions(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<RawPosition>>> {
        self.respond(ops::USER_POSITIONS, move |s| {
            Ok(s.positions.get(&user).cloned().unwrap_or_default())
        })
    }

    fn market_price(&self, market: MarketId) -> BoxFuture<'_, SyncResult<RawMarketPrice>> {
        self.respond(ops::MARKET_PRICE, move |s| {
            s.prices
                .get(&market)
                .copied()
                .ok_or_else(|| SyncError::Decode(format!("no price data for {market}")))
        })
    }

    fn liquidation(
        &self,
        user: UserAddress,
        market: MarketId,
    ) -> BoxFuture<'_, SyncResult<RawLiquidation>> {
        self.respond(ops::LIQUIDATION, move |s| {
            Ok(s.liquidations
                .get(&(user, market))
                .copied()
                .unwrap_or(RawLiquidation {
                    liquidation_price: None,
                    is_under_liquidation: false,
                }))
        })
    }

    fn margin_summary(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<RawMarginSummary>> {
        self.respond(ops::MARGIN_SUMMARY, move |s| {
            Ok(s.margins.get(&user).copied().unwrap_or_else(empty_margin))
        })
    }

    fn user_orders(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<OrderId>>> {
        self.respond(ops::USER_ORDERS, move |s| {
            Ok(s.orders.get(&user).cloned().unwrap_or_default())
        })
    }

    fn order(&self, id: OrderId) -> BoxFuture<'_, SyncResult<RawOrder>> {
        self.respond(ops::ORDER, move |s| {
            s.order_records
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::Decode(format!("unknown order {id}")))
        })
    }

    fn filled_amount(&self, id: OrderId) -> BoxFuture<'_, SyncResult<i128>> {
        self.respond(ops::FILLED_AMOUNT, move |s| {
            Ok(s.filled.get(&id).copied().unwrap_or(0))
        })
    }

    fn best_prices(&self) -> BoxFuture<'_, SyncResult<RawBestPrices>> {
        self.respond(ops::BEST_PRICES, |s| {
            Ok(s.best.unwrap_or(RawBestPrices {
                best_bid: 0,
                best_ask: 0,
            }))
        })
    }

    fn book_depth(&self, levels: u32) -> BoxFuture<'_, SyncResult<RawDepth>> {
        self.respond(ops::BOOK_DEPTH, move |s| {
            let levels = levels as usize;
            Ok(RawDepth {
                bids: s.depth.bids.iter().take(levels).copied().collect(),
                asks: s.depth.asks.iter().take(levels).copied().collect(),
            })
        })
    }
}

impl ChainWriter for MockChain {
    fn submit(
        &self,
        user: UserAddress,
        intent: WriteIntent,
    ) -> BoxFuture<'_, SyncResult<PendingTx>> {
        self.respond(intent.method(), move |s| {
            if let Some(reason) = &s.reject_writes {
                return Err(SyncError::WriteRejected(reason.clone()));
            }
            s.next_tx += 1;
            let hash = format!("0x{:064x}", s.next_tx);
            s.submitted.push((user, intent));
            Ok(PendingTx { hash })
        })
    }

    fn confirm(&self, tx: PendingTx) -> BoxFuture<'_, SyncResult<TxReceipt>> {
        self.respond(CONFIRM, move |s| {
            Ok(TxReceipt {
                hash: tx.hash,
                status: s.write_status.unwrap_or(TxStatus::Confirmed),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserAddress {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[tokio::test]
    async fn test_one_shot_failures_are_consumed() {
        let chain = MockChain::new();
        chain.fail_next(
            ops::USER_POSITIONS,
            2,
            SyncError::TransientNetwork("down".into()),
        );
        assert!(chain.user_positions(user()).await.is_err());
        assert!(chain.user_positions(user()).await.is_err());
        assert_eq!(chain.user_positions(user()).await, Ok(vec![]));
        assert_eq!(chain.calls(ops::USER_POSITIONS), 3);
    }

    #[tokio::test]
    async fn test_writes_are_recorded() {
        let chain = MockChain::new();
        let intent = WriteIntent::CancelOrder {
            order_id: OrderId(3),
        };
        let tx = chain.submit(user(), intent.clone()).await.unwrap();
        let receipt = chain.confirm(tx.clone()).await.unwrap();
        assert!(receipt.is_confirmed());
        assert_eq!(receipt.hash, tx.hash);
        assert_eq!(chain.submitted(), vec![(user(), intent)]);
    }
}
