//! Error types for perpsync-core.

use std::time::Duration;
use thiserror::Error;

/// Core error types (parsing and construction of domain values).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid market id: {0}")]
    InvalidMarketId(String),

    #[error("Fixed-point overflow: {0}")]
    Overflow(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Synchronization error taxonomy.
///
/// `Clone` so that a single coalesced outcome can be handed to every
/// waiter of the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Connection failure, HTTP 5xx, RPC node hiccup. Retried.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A single remote call exceeded its absolute timeout. Retried.
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed remote tuple. Never retried; the record is skipped.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Scope has no prior snapshot and the current refresh failed.
    #[error("Scope {scope} not initialized: {cause}")]
    NotInitialized { scope: String, cause: Box<SyncError> },

    /// Terminal after `attempts` failed attempts.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<SyncError> },

    /// A forwarded write was rejected or its transaction reverted.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Persisted cache read/write failure.
    #[error("Persistence error: {0}")]
    Persist(String),

    /// The owning scope was torn down before the result arrived.
    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Timeout(_))
    }

    /// Whether this is the retry-exhausted marker.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// The innermost error, unwrapping exhaustion and initialization wrappers.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            Self::RetryExhausted { last, .. } => last.root_cause(),
            Self::NotInitialized { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode",
            Self::NotInitialized { .. } => "not_initialized",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::WriteRejected(_) => "write_rejected",
            Self::Persist(_) => "persist",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Result type alias for synchronization operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::TransientNetwork("reset".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(15)).is_retryable());
        assert!(!SyncError::Decode("bad tuple".into()).is_retryable());
        assert!(!SyncError::WriteRejected("revert".into()).is_retryable());
    }

    #[test]
    fn test_root_cause_unwraps_nested() {
        let err = SyncError::NotInitialized {
            scope: "positions".into(),
            cause: Box::new(SyncError::RetryExhausted {
                attempts: 3,
                last: Box::new(SyncError::Timeout(Duration::from_secs(15))),
            }),
        };
        assert_eq!(err.root_cause(), &SyncError::Timeout(Duration::from_secs(15)));
        assert_eq!(err.kind(), "not_initialized");
    }
}
