//! Ordered producer strategies.
//!
//! A lookup that can be served by several sources (primary gateway, secondary
//! gateway, a static default) is expressed as a chain tried in order. The
//! first success wins; if every strategy fails the last error is returned.

use crate::source::BoxFuture;
use perpsync_core::{SyncError, SyncResult};
use tracing::{debug, warn};

type Strategy<'a, T> = Box<dyn Fn() -> BoxFuture<'a, SyncResult<T>> + Send + Sync + 'a>;

pub struct FallbackChain<'a, T> {
    operation: &'static str,
    strategies: Vec<(String, Strategy<'a, T>)>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            strategies: Vec::new(),
        }
    }

    /// Append a strategy.
    #[must_use]
    pub fn then<F>(mut self, name: impl Into<String>, strategy: F) -> Self
    where
        F: Fn() -> BoxFuture<'a, SyncResult<T>> + Send + Sync + 'a,
    {
        self.strategies.push((name.into(), Box::new(strategy)));
        self
    }

    /// Append a strategy that always yields `value`.
    #[must_use]
    pub fn or_default(self, name: impl Into<String>, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.then(name, move || {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn run(&self) -> SyncResult<T> {
        let mut last_error = None;
        for (idx, (name, strategy)) in self.strategies.iter().enumerate() {
            match strategy().await {
                Ok(value) => {
                    if idx > 0 {
                        debug!(
                            operation = self.operation,
                            strategy = %name,
                            "Served by fallback strategy"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        operation = self.operation,
                        strategy = %name,
                        error = %e,
                        "Strategy failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SyncError::Config(format!("no strategies for {}", self.operation))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_first_success_wins() {
        let secondary_calls = AtomicU32::new(0);
        let chain = FallbackChain::new("price")
            .then("primary", || {
                Box::pin(async { Err(SyncError::TransientNetwork("down".into())) })
            })
            .then("secondary", || {
                secondary_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(2u32) })
            })
            .then("tertiary", || Box::pin(async { Ok(3u32) }));

        assert_eq!(chain.run().await, Ok(2));
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failing_returns_last_error() {
        let chain: FallbackChain<'_, u32> = FallbackChain::new("price")
            .then("a", || Box::pin(async { Err(SyncError::TransientNetwork("a".into())) }))
            .then("b", || Box::pin(async { Err(SyncError::Decode("b".into())) }));
        assert_eq!(chain.run().await, Err(SyncError::Decode("b".into())));
    }

    #[tokio::test]
    async fn test_static_default_terminates_chain() {
        let chain = FallbackChain::new("price")
            .then("live", || {
                Box::pin(async { Err(SyncError::Timeout(std::time::Duration::from_secs(1))) })
            })
            .or_default("default", 7u32);
        assert_eq!(chain.run().await, Ok(7));
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_is_config_error() {
        let chain: FallbackChain<'_, u32> = FallbackChain::new("price");
        assert!(matches!(chain.run().await, Err(SyncError::Config(_))));
    }
}
