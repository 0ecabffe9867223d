//! Time-bounded key/value cache.
//!
//! Entries younger than `ttl` are `Fresh`; older ones are `Stale` but still
//! served until `stale_threshold`, after which `get` reports them absent.
//! Each write carries the timestamp at which its fetch *started*; a write is
//! rejected when the cached value came from a later fetch.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use perpsync_core::{Clock, SyncError, SyncResult};
use perpsync_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Freshness of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
        }
    }
}

/// Freshness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub ttl: Duration,
    pub stale_threshold: Duration,
}

impl TtlPolicy {
    /// `stale_threshold` must be at least `ttl`.
    pub fn new(ttl: Duration, stale_threshold: Duration) -> SyncResult<Self> {
        if stale_threshold < ttl {
            return Err(SyncError::Config(format!(
                "stale_threshold {stale_threshold:?} shorter than ttl {ttl:?}"
            )));
        }
        Ok(Self {
            ttl,
            stale_threshold,
        })
    }

    /// Classify an entry of the given age; `None` past the stale threshold.
    pub fn classify(&self, age: Duration) -> Option<Freshness> {
        if age < self.ttl {
            Some(Freshness::Fresh)
        } else if age < self.stale_threshold {
            Some(Freshness::Stale)
        } else {
            None
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

/// Stored entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// Start time of the fetch that produced `value`.
    pub fetched_at: DateTime<Utc>,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub fetched_at: DateTime<Utc>,
    pub state: Freshness,
}

impl<V> Cached<V> {
    pub fn is_fresh(&self) -> bool {
        self.state == Freshness::Fresh
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            fetched_at: self.fetched_at,
            state: self.state,
        }
    }
}

/// Outcome of [`TtlCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// A value from a later fetch is already cached.
    Superseded,
}

/// TTL cache keyed by `K`.
pub struct TtlCache<K, V> {
    /// Resource label for metrics and logs.
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    policy: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: Clone,
{
    pub fn new(name: &'static str, policy: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    /// Current time according to the cache clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn age(&self, fetched_at: DateTime<Utc>) -> Duration {
        (self.clock.now() - fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Read a value with its freshness; `None` if missing or too old to serve.
    pub fn get(&self, key: &K) -> Option<Cached<V>> {
        let Some(entry) = self.entries.get(key) else {
            Metrics::cache_lookup(self.name, "miss");
            return None;
        };
        match self.policy.classify(self.age(entry.fetched_at)) {
            Some(state) => {
                Metrics::cache_lookup(self.name, state.as_str());
                Some(Cached {
                    value: entry.value.clone(),
                    fetched_at: entry.fetched_at,
                    state,
                })
            }
            None => {
                Metrics::cache_lookup(self.name, "miss");
                None
            }
        }
    }

    /// Store `value` fetched starting at `fetch_started_at`.
    ///
    /// Rejected when the cached value was fetched later. Equal timestamps:
    /// the last write wins.
    pub fn put(&self, key: K, value: V, fetch_started_at: DateTime<Utc>) -> WriteOutcome {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().fetched_at > fetch_started_at {
                    debug!(
                        resource = self.name,
                        key = %occupied.key(),
                        cached_at = %occupied.get().fetched_at,
                        write_started_at = %fetch_started_at,
                        "Rejected out-of-order cache write"
                    );
                    Metrics::cache_stale_write(self.name);
                    return WriteOutcome::Superseded;
                }
                occupied.insert(CacheEntry {
                    value,
                    fetched_at: fetch_started_at,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    value,
                    fetched_at: fetch_started_at,
                });
            }
        }
        WriteOutcome::Stored
    }

    /// When the cached value for `key` was fetched, regardless of age.
    pub fn fetched_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.fetched_at)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Drop entries that are past the stale threshold.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = self.clock.now();
        let threshold = self.policy.stale_threshold;
        self.entries.retain(|_, e| {
            (now - e.fetched_at)
                .to_std()
                .map(|age| age < threshold)
                .unwrap_or(true)
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
