//! Cache and in-flight request identities.
//!
//! A key is composed from (resource kind, network, identity, parameters) so
//! that reads for different users or different resources never collide.
//! The `Display` form doubles as the persisted-store key:
//! `{resource}:v{schemaVersion}:{networkId}:{identity}[:{params}]`.

use crate::market::{MarketId, NetworkId, UserAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the cached payload layout. Bump when a snapshot type changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of remotely-sourced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Positions,
    MarginSummary,
    Orders,
    OrderBook,
    MarketPrice,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positions => "positions",
            Self::MarginSummary => "margin-summary",
            Self::Orders => "orders",
            Self::OrderBook => "order-book",
            Self::MarketPrice => "market-price",
        }
    }

    /// Whether the resource belongs to a single wallet.
    pub fn is_user_scoped(&self) -> bool {
        matches!(self, Self::Positions | Self::MarginSummary | Self::Orders)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one cached / coalesced read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub resource: ResourceKind,
    pub network: NetworkId,
    /// Wallet address, market id, or `*` for global resources.
    pub identity: String,
    /// Resource-specific parameters (e.g. book depth).
    pub params: Option<String>,
}

impl CacheKey {
    pub fn for_user(resource: ResourceKind, network: NetworkId, user: &UserAddress) -> Self {
        Self {
            resource,
            network,
            identity: user.to_string(),
            params: None,
        }
    }

    pub fn for_market(network: NetworkId, market: &MarketId) -> Self {
        Self {
            resource: ResourceKind::MarketPrice,
            network,
            identity: market.to_string(),
            params: None,
        }
    }

    pub fn global(resource: ResourceKind, network: NetworkId) -> Self {
        Self {
            resource,
            network,
            identity: "*".to_string(),
            params: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Wallet that owns this key, if user-scoped.
    pub fn owner(&self) -> Option<&str> {
        self.resource
            .is_user_scoped()
            .then_some(self.identity.as_str())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:v{}:{}:{}",
            self.resource, SCHEMA_VERSION, self.network, self.identity
        )?;
        if let Some(params) = &self.params {
            write!(f, ":{params}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> UserAddress {
        format!("0x{:040x}", n).parse().unwrap()
    }

    #[test]
    fn test_key_layout() {
        let key = CacheKey::for_user(ResourceKind::Positions, NetworkId::new(42161), &user(1));
        assert_eq!(
            key.to_string(),
            "positions:v1:42161:0x0000000000000000000000000000000000000001"
        );
        let book = CacheKey::global(ResourceKind::OrderBook, NetworkId::new(1)).with_params("10");
        assert_eq!(book.to_string(), "order-book:v1:1:*:10");
    }

    #[test]
    fn test_keys_isolate_users_and_resources() {
        let net = NetworkId::new(1);
        let a = CacheKey::for_user(ResourceKind::Positions, net, &user(1));
        let b = CacheKey::for_user(ResourceKind::Positions, net, &user(2));
        let c = CacheKey::for_user(ResourceKind::Orders, net, &user(1));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.owner(), Some(user(1).as_str()));
        assert_eq!(CacheKey::global(ResourceKind::OrderBook, net).owner(), None);
    }
}
