//! Persisted mirror of cached payloads.
//!
//! Values are wrapped in a versioned envelope that records the network and
//! owning wallet. On load, an envelope whose version, network or wallet does
//! not match the requesting key is treated as absent and removed; it is never
//! partially trusted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use perpsync_core::{CacheKey, NetworkId, SyncError, SyncResult, SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client-local key/value store.
///
/// Calls are synchronous and may block on I/O. Async callers keep writes on
/// the blocking pool; loads are single small reads on a cache miss.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> SyncResult<Option<String>>;
    fn store(&self, key: &str, value: &str) -> SyncResult<()>;
    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// In-memory store (tests, ephemeral sessions).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn store(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write never leaves a truncated entry behind.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Persist(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn load(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Persist(format!("read {}: {e}", path.display()))),
        }
    }

    fn store(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| SyncError::Persist(format!("write {}: {e}", path.display())))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Persist(format!("remove {}: {e}", path.display()))),
        }
    }
}

/// Stored layout: `{version, networkId, walletAddress, fetchedAt, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEnvelope<T> {
    pub version: u32,
    pub network_id: NetworkId,
    /// Owning wallet; `None` for global resources.
    pub wallet_address: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub payload: T,
}

/// Typed, validated access to a [`KeyValueStore`].
#[derive(Clone)]
pub struct PersistedMirror {
    store: Arc<dyn KeyValueStore>,
    version: u32,
}

impl PersistedMirror {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_version(store, SCHEMA_VERSION)
    }

    pub fn with_version(store: Arc<dyn KeyValueStore>, version: u32) -> Self {
        Self { store, version }
    }

    /// Write `payload` for `key`.
    pub fn save<T: Serialize>(
        &self,
        key: &CacheKey,
        fetched_at: DateTime<Utc>,
        payload: &T,
    ) -> SyncResult<()> {
        let envelope = PersistedEnvelope {
            version: self.version,
            network_id: key.network,
            wallet_address: key.owner().map(str::to_string),
            fetched_at,
            payload,
        };
        let json = serde_json::to_string(&envelope)
            .map_err(|e| SyncError::Persist(format!("encode {key}: {e}")))?;
        self.store.store(&key.to_string(), &json)
    }

    /// Read the payload for `key` if present and owned by the key's wallet.
    ///
    /// Anything that fails validation is removed and reported as absent.
    pub fn load<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> SyncResult<Option<(T, DateTime<Utc>)>> {
        let store_key = key.to_string();
        let Some(raw) = self.store.load(&store_key)? else {
            return Ok(None);
        };

        let envelope: PersistedEnvelope<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(key = %store_key, error = %e, "Discarding unreadable persisted entry");
                self.store.remove(&store_key)?;
                return Ok(None);
            }
        };

        if let Some(reason) = self.mismatch(key, &envelope) {
            debug!(key = %store_key, reason, "Discarding persisted entry");
            self.store.remove(&store_key)?;
            return Ok(None);
        }

        match serde_json::from_value::<T>(envelope.payload) {
            Ok(payload) => Ok(Some((payload, envelope.fetched_at))),
            Err(e) => {
                warn!(key = %store_key, error = %e, "Discarding persisted payload with stale layout");
                self.store.remove(&store_key)?;
                Ok(None)
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> SyncResult<()> {
        self.store.remove(&key.to_string())
    }

    fn mismatch<T>(&self, key: &CacheKey, envelope: &PersistedEnvelope<T>) -> Option<&'static str> {
        if envelope.version != self.version {
            return Some("version mismatch");
        }
        if envelope.network_id != key.network {
            return Some("network mismatch");
        }
        let stored = envelope.wallet_address.as_deref().map(str::to_ascii_lowercase);
        if stored.as_deref() != key.owner() {
            return Some("wallet mismatch");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::{ResourceKind, UserAddress};

    fn user(n: u8) -> UserAddress {
        format!("0x{:040x}", n).parse().unwrap()
    }

    fn key_for(n: u8) -> CacheKey {
        CacheKey::for_user(ResourceKind::MarginSummary, NetworkId::new(1), &user(n))
    }

    #[test]
    fn test_roundtrip_memory_store() {
        let mirror = PersistedMirror::new(Arc::new(MemoryStore::new()));
        let key = key_for(1);
        let at = Utc::now();
        mirror.save(&key, at, &vec![1u32, 2, 3]).unwrap();
        let (payload, fetched_at): (Vec<u32>, _) = mirror.load(&key).unwrap().unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(fetched_at, at);
    }

    #[test]
    fn test_version_mismatch_is_absent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let key = key_for(1);
        PersistedMirror::with_version(store.clone(), SCHEMA_VERSION + 1)
            .save(&key, Utc::now(), &1u32)
            .unwrap();

        let mirror = PersistedMirror::new(store.clone());
        assert!(mirror.load::<u32>(&key).unwrap().is_none());
        // Invalid entry was removed
        assert!(store.load(&key.to_string()).unwrap().is_none());
    }

    #[test]
    fn test_wallet_mismatch_is_absent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let key = key_for(1);
        let foreign = serde_json::json!({
            "version": SCHEMA_VERSION,
            "networkId": 1,
            "walletAddress": user(2).to_string(),
            "fetchedAt": Utc::now(),
            "payload": 5
        });
        store.store(&key.to_string(), &foreign.to_string()).unwrap();

        let mirror = PersistedMirror::new(store);
        assert!(mirror.load::<u32>(&key).unwrap().is_none());
    }

    #[test]
    fn test_payload_layout_change_is_absent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mirror = PersistedMirror::new(store);
        let key = key_for(3);
        mirror.save(&key, Utc::now(), &"not a number").unwrap();
        assert!(mirror.load::<u32>(&key).unwrap().is_none());
    }

    #[test]
    fn test_file_store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let key = key_for(4).to_string();

        assert!(store.load(&key).unwrap().is_none());
        store.store(&key, "{\"a\":1}").unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some("{\"a\":1}"));
        store.remove(&key).unwrap();
        assert!(store.load(&key).unwrap().is_none());
        // Removing twice is fine
        store.remove(&key).unwrap();
    }
}
