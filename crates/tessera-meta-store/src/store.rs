//! Durable store backing the versioned tables.
//!
//! The apply path never writes here directly: it stages mutations in the
//! table caches and the double buffer commits them as one [`WriteBatch`]
//! per flush. [`MetaStore`] is the redb implementation.

use crate::tables::{self, APPLIED_INDEX_KEY, TableId};
use redb::{Database, ReadableTable};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("version regression on {table}/{key}: current {current}, incoming {incoming}")]
    VersionRegression {
        table: TableId,
        key: String,
        current: u64,
        incoming: u64,
    },
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// An ordered set of per-table mutations committed atomically.
///
/// `None` values are deletions. Within a table, operations keep the order
/// in which they were pushed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    tables: BTreeMap<TableId, Vec<(String, Option<Vec<u8>>)>>,
    applied_index: Option<u64>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: TableId, key: impl Into<String>, value: Option<Vec<u8>>) {
        self.tables
            .entry(table)
            .or_default()
            .push((key.into(), value));
    }

    pub fn put(&mut self, table: TableId, key: impl Into<String>, value: Vec<u8>) {
        self.push(table, key, Some(value));
    }

    pub fn delete(&mut self, table: TableId, key: impl Into<String>) {
        self.push(table, key, None);
    }

    /// Record the highest log index covered by this batch
    pub const fn set_applied_index(&mut self, index: u64) {
        self.applied_index = Some(index);
    }

    #[must_use]
    pub const fn applied_index(&self) -> Option<u64> {
        self.applied_index
    }

    /// Operations for one table, in push order
    #[must_use]
    pub fn ops(&self, table: TableId) -> &[(String, Option<Vec<u8>>)] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &[(String, Option<Vec<u8>>)])> {
        self.tables.iter().map(|(t, ops)| (*t, ops.as_slice()))
    }

    /// Total number of key operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable key-value engine collaborator.
///
/// Implementations must apply a [`WriteBatch`] all-or-nothing; there are
/// no partial-batch semantics.
pub trait DurableStore: Send + Sync {
    fn get(&self, table: TableId, key: &str) -> MetaStoreResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, table: TableId, prefix: &str) -> MetaStoreResult<Vec<(String, Vec<u8>)>>;

    fn commit(&self, batch: &WriteBatch) -> MetaStoreResult<()>;

    /// Highest log index committed so far, if any
    fn applied_index(&self) -> MetaStoreResult<Option<u64>>;
}

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            for table in TableId::ALL {
                let _t = write_txn.open_table(table.definition())?;
            }
            let _t = write_txn.open_table(tables::TRANSACTION_INFO)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl DurableStore for MetaStore {
    fn get(&self, table: TableId, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_prefix(&self, table: TableId, prefix: &str) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        let mut result = Vec::new();
        for entry in t.range(prefix..)? {
            let (k, v) = entry?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            result.push((key.to_string(), v.value().to_vec()));
        }
        Ok(result)
    }

    fn commit(&self, batch: &WriteBatch) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            for (table, ops) in batch.tables() {
                let mut t = write_txn.open_table(table.definition())?;
                for (key, value) in ops {
                    match value {
                        Some(bytes) => {
                            t.insert(key.as_str(), bytes.as_slice())?;
                        }
                        None => {
                            t.remove(key.as_str())?;
                        }
                    }
                }
            }
            if let Some(index) = batch.applied_index() {
                let mut info = write_txn.open_table(tables::TRANSACTION_INFO)?;
                info.insert(APPLIED_INDEX_KEY, index)?;
            }
        }
        write_txn.commit()?;
        debug!(
            "Committed batch of {} ops (applied index {:?})",
            batch.len(),
            batch.applied_index()
        );
        Ok(())
    }

    fn applied_index(&self) -> MetaStoreResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let info = read_txn.open_table(tables::TRANSACTION_INFO)?;
        Ok(info.get(APPLIED_INDEX_KEY)?.map(|v| v.value()))
    }
}
