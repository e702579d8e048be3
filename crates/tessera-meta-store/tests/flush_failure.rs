//! Durable-write failures halt the double buffer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tessera_common::config::FlushConfig;
use tessera_meta_store::{
    DoubleBuffer, DurableStore, FlushError, MetaStore, MetaStoreError, MetaStoreResult,
    MetadataManager, TableId, WriteBatch,
};
use tempfile::tempdir;

/// Wraps a real store and fails commits or index reads once armed
struct FlakyStore {
    inner: MetaStore,
    fail_commits: AtomicBool,
    fail_reads: AtomicBool,
    committed: Mutex<Vec<WriteBatch>>,
}

impl DurableStore for FlakyStore {
    fn get(&self, table: TableId, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn scan_prefix(&self, table: TableId, prefix: &str) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(table, prefix)
    }

    fn commit(&self, batch: &WriteBatch) -> MetaStoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Unavailable("disk full".into()));
        }
        self.inner.commit(batch)?;
        self.committed.lock().push(batch.clone());
        Ok(())
    }

    fn applied_index(&self) -> MetaStoreResult<Option<u64>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Unavailable("read error".into()));
        }
        self.inner.applied_index()
    }
}

fn setup() -> (tempfile::TempDir, Arc<FlakyStore>, Arc<MetadataManager>, DoubleBuffer) {
    let dir = tempdir().unwrap();
    let store = Arc::new(FlakyStore {
        inner: MetaStore::open(dir.path().join("meta.redb")).unwrap(),
        fail_commits: AtomicBool::new(false),
        fail_reads: AtomicBool::new(false),
        committed: Mutex::new(Vec::new()),
    });
    let manager = Arc::new(MetadataManager::new(
        store.clone() as Arc<dyn DurableStore>,
        Duration::from_secs(1),
    ));
    let buffer = DoubleBuffer::new(Arc::clone(&manager), FlushConfig::default()).unwrap();
    (dir, store, manager, buffer)
}

#[test]
fn test_batch_is_index_ordered() {
    let (_dir, store, manager, buffer) = setup();
    let mappings = manager.s3_table();

    // Added out of order
    let w5 = mappings.stage_put("b", "s3bob/b".to_string(), 5).unwrap();
    let w3 = mappings.stage_put("a", "s3alice/a".to_string(), 3).unwrap();
    let f5 = buffer.add(5, vec![w5]);
    let f3 = buffer.add(3, vec![w3]);

    assert_eq!(buffer.flush_now().unwrap(), 2);
    assert_eq!(f3.wait(), Ok(3));
    assert_eq!(f5.wait(), Ok(5));

    let committed = store.committed.lock();
    assert_eq!(committed.len(), 1);
    let keys: Vec<&str> = committed[0]
        .ops(TableId::S3Mappings)
        .iter()
        .map(|(k, _)| k.as_str())
        .collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert_eq!(committed[0].applied_index(), Some(5));
}

#[test]
fn test_new_buffer_resumes_at_applied_index() {
    let (_dir, store, manager, buffer) = setup();
    let w = manager.s3_table().stage_put("a", "s3alice/a".to_string(), 4).unwrap();
    let f = buffer.add(4, vec![w]);
    assert_eq!(buffer.flush_now().unwrap(), 1);
    assert_eq!(f.wait(), Ok(4));

    let resumed = DoubleBuffer::new(Arc::clone(&manager), FlushConfig::default()).unwrap();
    assert_eq!(resumed.stats().flushed_index, 4);

    store.fail_reads.store(true, Ordering::SeqCst);
    let err = DoubleBuffer::new(manager, FlushConfig::default()).err();
    assert!(matches!(err, Some(MetaStoreError::Unavailable(_))), "{err:?}");
}

#[test]
fn test_commit_failure_halts_engine() {
    let (_dir, store, manager, buffer) = setup();
    let mappings = manager.s3_table();

    let write = mappings.stage_put("logs", "s3alice/logs".to_string(), 1).unwrap();
    let pending = buffer.add(1, vec![write]);

    store.fail_commits.store(true, Ordering::SeqCst);
    let err = buffer.flush_now().unwrap_err();
    assert!(matches!(err, FlushError::Persist(_)));
    assert!(buffer.is_halted());
    assert_eq!(pending.wait(), Err(FlushError::Halted));

    // Overlay is not evicted: it is still the only copy
    assert_eq!(manager.cached_entries(), 1);

    // Later submissions fail immediately, even once the store recovers
    store.fail_commits.store(false, Ordering::SeqCst);
    let later = buffer.add(2, Vec::new());
    assert_eq!(later.wait(), Err(FlushError::Halted));
    assert_eq!(buffer.flush_now(), Err(FlushError::Halted));
    assert!(store.committed.lock().is_empty());
}

#[tokio::test]
async fn test_flush_loop_exits_on_failure() {
    let (_dir, store, manager, buffer) = setup();
    let buffer = Arc::new(buffer);
    store.fail_commits.store(true, Ordering::SeqCst);

    let write = manager
        .s3_table()
        .stage_put("logs", "s3alice/logs".to_string(), 1)
        .unwrap();
    let pending = buffer.add(1, vec![write]);
    let handle = buffer.start();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap();
    assert_eq!(result, Err(FlushError::Halted));
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(buffer.is_halted());
}
