//! Application configuration.

use crate::error::{AppError, AppResult};
use perpsync_cache::TtlPolicy;
use perpsync_core::{NetworkId, ResourceKind, UserAddress};
use perpsync_remote::{GatewayConfig, RetryPolicy};
use perpsync_sync::{EngineConfig, ScopeOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where remote data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Read from the configured view gateway.
    #[default]
    Live,
    /// In-process empty chain; exercises the scopes without network access.
    DryRun,
}

/// Network and gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Chain id; every cache key is scoped to it.
    #[serde(default = "default_network_id")]
    pub id: u64,
    /// Primary gateway first, fallbacks after.
    #[serde(default)]
    pub gateway_urls: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Gateway requests per minute (0 = unlimited).
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
}

fn default_network_id() -> u64 {
    42161
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_max_requests_per_minute() -> u32 {
    600
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: default_network_id(),
            gateway_urls: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            max_requests_per_minute: default_max_requests_per_minute(),
        }
    }
}

/// Cache windows and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Overrides the per-resource TTL (which otherwise equals its poll interval).
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Age past which cached data is no longer served.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Directory mirroring user-scoped snapshots across restarts.
    #[serde(default)]
    pub persist_dir: Option<String>,
}

fn default_stale_threshold_ms() -> u64 {
    300_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            stale_threshold_ms: default_stale_threshold_ms(),
            persist_dir: None,
        }
    }
}

/// Retry envelope for remote reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_jitter_ms() -> u64 {
    1_000
}

fn default_attempt_timeout_ms() -> u64 {
    15_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            jitter_ms: default_jitter_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

/// Poll intervals per resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_positions_ms")]
    pub positions_ms: u64,
    #[serde(default = "default_margin_ms")]
    pub margin_ms: u64,
    #[serde(default = "default_orders_ms")]
    pub orders_ms: u64,
    #[serde(default = "default_book_ms")]
    pub book_ms: u64,
    #[serde(default = "default_market_price_ms")]
    pub market_price_ms: u64,
}

fn default_positions_ms() -> u64 {
    10_000
}

fn default_margin_ms() -> u64 {
    15_000
}

fn default_orders_ms() -> u64 {
    5_000
}

fn default_book_ms() -> u64 {
    5_000
}

fn default_market_price_ms() -> u64 {
    5_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            positions_ms: default_positions_ms(),
            margin_ms: default_margin_ms(),
            orders_ms: default_orders_ms(),
            book_ms: default_book_ms(),
            market_price_ms: default_market_price_ms(),
        }
    }
}

/// Logging and housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// How often expired cache entries are purged and metrics logged.
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

fn default_log_filter() -> String {
    "info,perpsync=debug".to_string()
}

fn default_housekeeping_interval_ms() -> u64 {
    60_000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Wallet addresses whose views are kept in sync.
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default = "default_book_depth_levels")]
    pub book_depth_levels: u32,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_book_depth_levels() -> u32 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            network: NetworkConfig::default(),
            users: Vec::new(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            polling: PollingConfig::default(),
            book_depth_levels: default_book_depth_levels(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Parsed, deduplicated user addresses.
    pub fn user_addresses(&self) -> AppResult<Vec<UserAddress>> {
        let mut users = Vec::with_capacity(self.users.len());
        for raw in &self.users {
            let user: UserAddress = raw
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid user address {raw:?}: {e}")))?;
            if !users.contains(&user) {
                users.push(user);
            }
        }
        Ok(users)
    }

    pub fn engine_config(&self) -> AppResult<EngineConfig> {
        let retry = RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
        )
        .with_jitter(Duration::from_millis(self.retry.jitter_ms))
        .with_attempt_timeout(Duration::from_millis(self.retry.attempt_timeout_ms));

        let mut config = EngineConfig::default()
            .with_network(NetworkId::new(self.network.id))
            .with_retry(retry);
        config.book_depth_levels = self.book_depth_levels;

        let polling = &self.polling;
        for (kind, poll_ms) in [
            (ResourceKind::Positions, polling.positions_ms),
            (ResourceKind::MarginSummary, polling.margin_ms),
            (ResourceKind::Orders, polling.orders_ms),
            (ResourceKind::OrderBook, polling.book_ms),
            (ResourceKind::MarketPrice, polling.market_price_ms),
        ] {
            let poll_interval = Duration::from_millis(poll_ms);
            let ttl = self
                .cache
                .ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_interval);
            config.set_scope(
                kind,
                ScopeOptions {
                    poll_interval,
                    cache: TtlPolicy {
                        ttl,
                        stale_threshold: Duration::from_millis(self.cache.stale_threshold_ms),
                    },
                },
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            endpoints: self.network.gateway_urls.clone(),
            request_timeout: Duration::from_millis(self.network.request_timeout_ms),
            max_requests: self.network.max_requests_per_minute,
            rate_window: Duration::from_secs(60),
            ..GatewayConfig::default()
        }
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.housekeeping_interval_ms.max(1_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.mode, OperatingMode::Live);
        assert_eq!(config.network.id, 42161);
        assert_eq!(config.polling.positions_ms, 10_000);
        assert_eq!(config.polling.margin_ms, 15_000);
        assert_eq!(config.book_depth_levels, 10);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.orders.poll_interval, Duration::from_secs(5));
        assert_eq!(engine.orders.cache.ttl, Duration::from_secs(5));
        assert_eq!(engine.margin.cache.stale_threshold, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_toml(
            r#"
            mode = "dry_run"
            users = [
                "0x00000000000000000000000000000000000000AA",
                "0x00000000000000000000000000000000000000aa",
            ]
            book_depth_levels = 20

            [network]
            id = 421614
            gateway_urls = ["https://a.example", "https://b.example"]

            [cache]
            ttl_ms = 2000
            persist_dir = "/tmp/perpsync"

            [retry]
            max_attempts = 5

            [polling]
            orders_ms = 3000
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, OperatingMode::DryRun);
        assert_eq!(config.user_addresses().unwrap().len(), 1);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.gateway_config().endpoints.len(), 2);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.network, NetworkId::new(421614));
        assert_eq!(engine.retry.max_attempts, 5);
        assert_eq!(engine.book_depth_levels, 20);
        assert_eq!(engine.orders.poll_interval, Duration::from_millis(3000));
        assert_eq!(engine.positions.cache.ttl, Duration::from_millis(2000));
    }

    #[test]
    fn test_invalid_user_is_rejected() {
        let config = AppConfig::from_toml(r#"users = ["0x1234"]"#).unwrap();
        assert!(matches!(config.user_addresses(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_attempts_fail_validation() {
        let config = AppConfig::from_toml("[retry]\nmax_attempts = 0").unwrap();
        assert!(matches!(config.engine_config(), Err(AppError::Sync(_))));
    }
}
