//! Single-flight request coalescing.
//!
//! `fetch(key, producer)` starts `producer` only when no request for `key`
//! is in flight; concurrent callers for the same key await the same shared
//! outcome. The producer runs as its own task, so a caller that goes away
//! does not abort a request other callers are waiting on. The registry entry
//! is removed by the task itself before its result is published, so the next
//! call after settlement always starts a fresh attempt.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use perpsync_core::{SyncError, SyncResult};
use perpsync_telemetry::Metrics;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace};

type SharedOutcome<T> = Shared<BoxFuture<'static, SyncResult<T>>>;
type Registry<K, T> = Arc<Mutex<HashMap<K, SharedOutcome<T>>>>;

/// Removes the registry entry when the producer task ends, including on panic.
struct InflightGuard<K: Eq + Hash, T> {
    registry: Registry<K, T>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for InflightGuard<K, T> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Registry of in-flight requests.
pub struct Coalescer<K, T> {
    /// Resource label for metrics and logs.
    name: &'static str,
    inflight: Registry<K, T>,
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `producer` for `key` unless a request is already in flight, in
    /// which case join it. Every caller of one flight sees the same outcome.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn fetch<F, Fut>(&self, key: K, producer: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                trace!(resource = self.name, %key, "Joining in-flight request");
                Metrics::coalesce_joined(self.name);
                existing.clone()
            } else {
                debug!(resource = self.name, %key, "Starting request");
                Metrics::coalesce_started(self.name);

                let guard = InflightGuard {
                    registry: Arc::clone(&self.inflight),
                    key: key.clone(),
                };
                let work = producer();
                // The guard lives in the task; the lock held here keeps the
                // task from removing the entry before it is inserted.
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    work.await
                });
                let shared = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_cancelled() => Err(SyncError::Cancelled),
                        Err(e) => Err(SyncError::TransientNetwork(format!(
                            "fetch task failed: {e}"
                        ))),
                    }
                }
                .boxed()
                .shared();
                inflight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of keys with a request in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_fetches_invoke_producer_once() {
        let coalescer: Coalescer<String, u64> = Coalescer::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let fetches = (0..10).map(|_| {
            let calls = calls.clone();
            let gate = gate.clone();
            coalescer.fetch("positions:a".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(42)
            })
        });

        let release = {
            let gate = gate.clone();
            async move {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        };
        let (results, ()) = tokio::join!(join_all(fetches), release);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_does_not_poison_key() {
        let coalescer: Coalescer<String, u64> = Coalescer::new("test");
        let key = "margin:a".to_string();

        let (a, b) = tokio::join!(
            coalescer.fetch(key.clone(), || async {
                tokio::task::yield_now().await;
                Err(SyncError::TransientNetwork("reset".into()))
            }),
            coalescer.fetch(key.clone(), || async { Ok(1) }),
        );
        assert_eq!(a, Err(SyncError::TransientNetwork("reset".into())));
        assert_eq!(a, b);
        assert!(!coalescer.is_in_flight(&key));

        let next = coalescer.fetch(key.clone(), || async { Ok(7) }).await;
        assert_eq!(next, Ok(7));
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let coalescer: Coalescer<String, u64> = Coalescer::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |key: &str| {
            let calls = calls.clone();
            coalescer.fetch(key.to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(1)
            })
        };
        let (a, b) = tokio::join!(fetch("positions:user-a"), fetch("positions:user-b"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_abort_shared_request() {
        let coalescer: Arc<Coalescer<String, u64>> = Arc::new(Coalescer::new("test"));
        let gate = Arc::new(Notify::new());
        let key = "orders:a".to_string();

        let first = {
            let coalescer = coalescer.clone();
            let gate = gate.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coalescer
                    .fetch(key, move || async move {
                        gate.notified().await;
                        Ok(5)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        while !coalescer.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }
        first.abort();

        let second = {
            let coalescer = coalescer.clone();
            let key = key.clone();
            tokio::spawn(async move { coalescer.fetch(key, || async { Ok(99) }).await })
        };
        tokio::task::yield_now().await;
        gate.notify_one();

        // The second caller joined the original flight
        assert_eq!(second.await.unwrap(), Ok(5));
    }
}
