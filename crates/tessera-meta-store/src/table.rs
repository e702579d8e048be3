//! Versioned tables with an in-memory overlay.
//!
//! Every entry carries the log index that last wrote it. The overlay cache
//! is authoritative for reads until the double buffer has persisted the
//! entry; after that the entry is evicted and reads fall through to the
//! durable store, which keeps the version alongside the value.
//!
//! Callers must hold the lock manager's lock for a key while looking it up
//! and staging a mutation for it.

use crate::store::{DurableStore, MetaStoreError, MetaStoreResult};
use crate::tables::TableId;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Overlay entry; `value == None` is a tombstone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheValue<V> {
    pub value: Option<V>,
    pub version: u64,
}

/// Result of looking a key up through the overlay
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup<V> {
    Present { value: V, version: u64 },
    /// Deleted in the overlay, not yet flushed
    Deleted { version: u64 },
    Absent,
}

impl<V> Lookup<V> {
    /// Version of the last write, including deletions still in the overlay
    pub const fn version(&self) -> Option<u64> {
        match self {
            Self::Present { version, .. } | Self::Deleted { version } => Some(*version),
            Self::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Present { value, .. } => Some(value),
            Self::Deleted { .. } | Self::Absent => None,
        }
    }

    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

/// A mutation staged in the overlay, waiting to be flushed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedWrite {
    pub table: TableId,
    pub key: String,
    /// Encoded `(version, value)`; `None` deletes the key
    pub value: Option<Vec<u8>>,
    pub version: u64,
}

#[derive(Serialize)]
struct StoredEntryRef<'a, V> {
    version: u64,
    value: &'a V,
}

#[derive(Deserialize)]
struct StoredEntry<V> {
    version: u64,
    value: V,
}

/// Key → (value, version) table with a cache overlay over a durable store
pub struct VersionedTable<V> {
    id: TableId,
    store: Arc<dyn DurableStore>,
    cache: RwLock<HashMap<String, CacheValue<V>>>,
}

impl<V> VersionedTable<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(id: TableId, store: Arc<dyn DurableStore>) -> Self {
        Self {
            id,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Look a key up, overlay first
    pub fn lookup(&self, key: &str) -> MetaStoreResult<Lookup<V>> {
        if let Some(cached) = self.cache.read().get(key) {
            return Ok(match &cached.value {
                Some(value) => Lookup::Present {
                    value: value.clone(),
                    version: cached.version,
                },
                None => Lookup::Deleted {
                    version: cached.version,
                },
            });
        }

        match self.store.get(self.id, key)? {
            Some(bytes) => {
                let entry: StoredEntry<V> = bincode::deserialize(&bytes)?;
                Ok(Lookup::Present {
                    value: entry.value,
                    version: entry.version,
                })
            }
            None => Ok(Lookup::Absent),
        }
    }

    pub fn get(&self, key: &str) -> MetaStoreResult<Option<V>> {
        Ok(self.lookup(key)?.into_value())
    }

    pub fn exists(&self, key: &str) -> MetaStoreResult<bool> {
        Ok(self.lookup(key)?.is_present())
    }

    /// Stage `value` for `key` at `version` in the overlay.
    pub fn stage_put(&self, key: &str, value: V, version: u64) -> MetaStoreResult<StagedWrite> {
        self.check_version(key, version)?;
        let bytes = bincode::serialize(&StoredEntryRef {
            version,
            value: &value,
        })?;
        self.cache.write().insert(
            key.to_string(),
            CacheValue {
                value: Some(value),
                version,
            },
        );
        trace!("Staged {}/{} at version {}", self.id, key, version);
        Ok(StagedWrite {
            table: self.id,
            key: key.to_string(),
            value: Some(bytes),
            version,
        })
    }

    /// Stage a tombstone for `key` at `version`.
    pub fn stage_delete(&self, key: &str, version: u64) -> MetaStoreResult<StagedWrite> {
        self.check_version(key, version)?;
        self.cache.write().insert(
            key.to_string(),
            CacheValue {
                value: None,
                version,
            },
        );
        trace!("Staged delete of {}/{} at version {}", self.id, key, version);
        Ok(StagedWrite {
            table: self.id,
            key: key.to_string(),
            value: None,
            version,
        })
    }

    /// Live keys starting with `prefix`, overlay applied, in key order
    pub fn keys_with_prefix(&self, prefix: &str) -> MetaStoreResult<Vec<String>> {
        let mut keys: BTreeSet<String> = self
            .store
            .scan_prefix(self.id, prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        let cache = self.cache.read();
        for (key, cached) in cache.iter().filter(|(k, _)| k.starts_with(prefix)) {
            if cached.value.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }

        Ok(keys.into_iter().collect())
    }

    /// Drop the overlay entry for `key` if it still holds `version`.
    ///
    /// Returns true when an entry was removed.
    pub fn evict_flushed(&self, key: &str, version: u64) -> bool {
        let mut cache = self.cache.write();
        if cache.get(key).is_some_and(|c| c.version == version) {
            cache.remove(key);
            return true;
        }
        false
    }

    /// Overlay entry for `key`, if any
    pub fn cached(&self, key: &str) -> Option<CacheValue<V>> {
        self.cache.read().get(key).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn check_version(&self, key: &str, incoming: u64) -> MetaStoreResult<()> {
        if let Some(current) = self.lookup(key)?.version()
            && current > incoming
        {
            return Err(MetaStoreError::VersionRegression {
                table: self.id,
                key: key.to_string(),
                current,
                incoming,
            });
        }
        Ok(())
    }
}
