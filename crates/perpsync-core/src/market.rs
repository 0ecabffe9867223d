//! Identities: network, user wallet, market.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chain / network identity (EIP-155 chain id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub u64);

impl NetworkId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wallet address, normalized to lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserAddress(String);

impl UserAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| CoreError::InvalidAddress(format!("missing 0x prefix: {s}")))?;
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidAddress(format!(
                "expected 40 hex digits: {s}"
            )));
        }
        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for UserAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<UserAddress> for String {
    fn from(addr: UserAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque market key as reported by the order book (usually a bytes32 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketId(String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.contains(':') {
            return Err(CoreError::InvalidMarketId(id));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MarketId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for MarketId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MarketId> for String {
    fn from(id: MarketId) -> Self {
        id.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let addr: UserAddress = "0xABCDEFabcdef0123456789ABCDEFabcdef012345".parse().unwrap();
        assert_eq!(addr.as_str(), "0xabcdefabcdef0123456789abcdefabcdef012345");
    }

    #[test]
    fn test_address_rejects_malformed() {
        assert!("abcdef".parse::<UserAddress>().is_err());
        assert!("0x1234".parse::<UserAddress>().is_err());
        assert!("0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
            .parse::<UserAddress>()
            .is_err());
    }

    #[test]
    fn test_market_id_rejects_key_separator() {
        assert!(MarketId::new("ETH-PERP").is_ok());
        assert!(MarketId::new("a:b").is_err());
        assert!(MarketId::new("  ").is_err());
    }

    #[test]
    fn test_address_serde_validates() {
        let ok: UserAddress =
            serde_json::from_str("\"0x00000000000000000000000000000000000000aa\"").unwrap();
        assert_eq!(ok.to_string(), "0x00000000000000000000000000000000000000aa");
        assert!(serde_json::from_str::<UserAddress>("\"0x12\"").is_err());
    }
}
