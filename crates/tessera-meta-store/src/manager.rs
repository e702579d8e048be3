//! Entity tables, their lock manager and key layout.

use crate::lock::LockManager;
use crate::store::{DurableStore, MetaStore, MetaStoreResult};
use crate::table::{StagedWrite, VersionedTable};
use crate::tables::TableId;
use crate::types::{BucketRecord, OwnerVolumes, VolumeRecord};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::KEY_PREFIX;
use tracing::info;

/// Shared metadata state touched by the apply path
pub struct MetadataManager {
    store: Arc<dyn DurableStore>,
    lock: LockManager,
    volumes: VersionedTable<VolumeRecord>,
    buckets: VersionedTable<BucketRecord>,
    users: VersionedTable<OwnerVolumes>,
    s3_mappings: VersionedTable<String>,
}

impl MetadataManager {
    pub fn new(store: Arc<dyn DurableStore>, lock_timeout: Duration) -> Self {
        Self {
            volumes: VersionedTable::new(TableId::Volumes, Arc::clone(&store)),
            buckets: VersionedTable::new(TableId::Buckets, Arc::clone(&store)),
            users: VersionedTable::new(TableId::Users, Arc::clone(&store)),
            s3_mappings: VersionedTable::new(TableId::S3Mappings, Arc::clone(&store)),
            lock: LockManager::new(lock_timeout),
            store,
        }
    }

    /// Open a redb-backed manager at `path`
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        let store = MetaStore::open(path)?;
        let manager = Self::new(Arc::new(store), lock_timeout);
        info!(
            "Opened metadata store at {} (applied index {:?})",
            path.display(),
            manager.applied_index()?
        );
        Ok(manager)
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub const fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub const fn volume_table(&self) -> &VersionedTable<VolumeRecord> {
        &self.volumes
    }

    pub const fn bucket_table(&self) -> &VersionedTable<BucketRecord> {
        &self.buckets
    }

    pub const fn user_table(&self) -> &VersionedTable<OwnerVolumes> {
        &self.users
    }

    pub const fn s3_table(&self) -> &VersionedTable<String> {
        &self.s3_mappings
    }

    // ---- Key layout ----

    /// `/volume`
    pub fn volume_key(volume: &str) -> String {
        format!("{KEY_PREFIX}{volume}")
    }

    /// `/volume/bucket`
    pub fn bucket_key(volume: &str, bucket: &str) -> String {
        format!("{KEY_PREFIX}{volume}{KEY_PREFIX}{bucket}")
    }

    /// Prefix shared by every bucket key of `volume`
    pub fn bucket_prefix(volume: &str) -> String {
        format!("{KEY_PREFIX}{volume}{KEY_PREFIX}")
    }

    pub fn user_key(user: &str) -> String {
        user.to_string()
    }

    // ---- Flush support ----

    /// Drop the overlay entry a flushed write produced
    pub fn evict_flushed(&self, write: &StagedWrite) -> bool {
        match write.table {
            TableId::Volumes => self.volumes.evict_flushed(&write.key, write.version),
            TableId::Buckets => self.buckets.evict_flushed(&write.key, write.version),
            TableId::Users => self.users.evict_flushed(&write.key, write.version),
            TableId::S3Mappings => self.s3_mappings.evict_flushed(&write.key, write.version),
        }
    }

    /// Total overlay entries across all tables
    pub fn cached_entries(&self) -> usize {
        self.volumes.cache_len()
            + self.buckets.cache_len()
            + self.users.cache_len()
            + self.s3_mappings.cache_len()
    }

    /// Highest log index persisted by the double buffer
    pub fn applied_index(&self) -> MetaStoreResult<Option<u64>> {
        self.store.applied_index()
    }
}
