//! Engine and scope configuration.

use perpsync_cache::TtlPolicy;
use perpsync_core::{NetworkId, ResourceKind, SyncError, SyncResult};
use perpsync_remote::RetryPolicy;
use std::time::Duration;

/// Refresh cadence and cache windows for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Periodic refresh interval.
    pub poll_interval: Duration,
    /// Freshness windows of the resource's cache.
    pub cache: TtlPolicy,
}

impl ScopeOptions {
    /// Options whose TTL equals the poll interval, served stale for up to
    /// five minutes.
    pub fn polling(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            cache: TtlPolicy {
                ttl: poll_interval,
                stale_threshold: DEFAULT_STALE_THRESHOLD.max(poll_interval),
            },
        }
    }

    fn validate(&self, kind: ResourceKind) -> SyncResult<()> {
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config(format!("{kind}: poll interval must be > 0")));
        }
        TtlPolicy::new(self.cache.ttl, self.cache.stale_threshold)
            .map(|_| ())
            .map_err(|e| SyncError::Config(format!("{kind}: {e}")))
    }
}

const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Everything a [`crate::SyncEngine`] needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Network every cache key is scoped to.
    pub network: NetworkId,
    /// Retry envelope applied to every remote read.
    pub retry: RetryPolicy,
    pub positions: ScopeOptions,
    pub margin: ScopeOptions,
    pub orders: ScopeOptions,
    pub order_book: ScopeOptions,
    pub market_price: ScopeOptions,
    /// Depth requested for order book scopes.
    pub book_depth_levels: u32,
    /// Queued commands per scope before further triggers are folded.
    pub command_buffer: usize,
    /// Capacity of the invalidation broadcast.
    pub invalidation_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: NetworkId::new(1),
            retry: RetryPolicy::default(),
            positions: ScopeOptions::polling(Duration::from_secs(10)),
            margin: ScopeOptions::polling(Duration::from_secs(15)),
            orders: ScopeOptions::polling(Duration::from_secs(5)),
            order_book: ScopeOptions::polling(Duration::from_secs(5)),
            market_price: ScopeOptions::polling(Duration::from_secs(5)),
            book_depth_levels: 10,
            command_buffer: 8,
            invalidation_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_network(mut self, network: NetworkId) -> Self {
        self.network = network;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Options for scopes of `kind`.
    pub fn scope(&self, kind: ResourceKind) -> ScopeOptions {
        match kind {
            ResourceKind::Positions => self.positions,
            ResourceKind::MarginSummary => self.margin,
            ResourceKind::Orders => self.orders,
            ResourceKind::OrderBook => self.order_book,
            ResourceKind::MarketPrice => self.market_price,
        }
    }

    pub fn set_scope(&mut self, kind: ResourceKind, options: ScopeOptions) {
        match kind {
            ResourceKind::Positions => self.positions = options,
            ResourceKind::MarginSummary => self.margin = options,
            ResourceKind::Orders => self.orders = options,
            ResourceKind::OrderBook => self.order_book = options,
            ResourceKind::MarketPrice => self.market_price = options,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(SyncError::Config("retry.attempt_timeout must be > 0".into()));
        }
        if self.book_depth_levels == 0 {
            return Err(SyncError::Config("book_depth_levels must be >= 1".into()));
        }
        if self.command_buffer == 0 || self.invalidation_capacity == 0 {
            return Err(SyncError::Config("channel capacities must be >= 1".into()));
        }
        for kind in [
            ResourceKind::Positions,
            ResourceKind::MarginSummary,
            ResourceKind::Orders,
            ResourceKind::OrderBook,
            ResourceKind::MarketPrice,
        ] {
            self.scope(kind).validate(kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = EngineConfig::default();
        assert_eq!(config.positions.poll_interval, Duration::from_secs(10));
        assert_eq!(config.margin.poll_interval, Duration::from_secs(15));
        assert_eq!(config.orders.poll_interval, Duration::from_secs(5));
        assert_eq!(config.order_book.poll_interval, Duration::from_secs(5));
        assert_eq!(config.positions.cache.ttl, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_windows() {
        let mut config = EngineConfig::default();
        config.set_scope(
            ResourceKind::Orders,
            ScopeOptions {
                poll_interval: Duration::from_secs(5),
                cache: TtlPolicy {
                    ttl: Duration::from_secs(60),
                    stale_threshold: Duration::from_secs(30),
                },
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_validate_rejects_zero_poll() {
        let mut config = EngineConfig::default();
        config.margin.poll_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_long_poll_extends_stale_threshold() {
        let options = ScopeOptions::polling(Duration::from_secs(600));
        assert_eq!(options.cache.stale_threshold, Duration::from_secs(600));
    }
}
