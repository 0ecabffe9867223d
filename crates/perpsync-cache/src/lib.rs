//! Caching and single-flight primitives for perpsync.
//!
//! - `TtlCache`: fresh / stale-but-usable / absent entries with a
//!   fetch-start timestamp guard against out-of-order writes
//! - `Coalescer`: at most one in-flight remote call per key
//! - `PersistedMirror`: versioned, owner-checked copy of cached payloads in a
//!   key-value store

pub mod coalescer;
pub mod persisted;
pub mod ttl;

pub use coalescer::Coalescer;
pub use persisted::{FileStore, KeyValueStore, MemoryStore, PersistedEnvelope, PersistedMirror};
pub use ttl::{CacheEntry, Cached, Freshness, TtlCache, TtlPolicy, WriteOutcome};
