//! Concurrent apply and flush-failure behavior of the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tessera_common::config::{FlushConfig, LimitsConfig};
use tessera_common::{MetaConfig, ResultCode, UserInfo};
use tessera_meta_apply::{
    CreateS3BucketRequest, CreateVolumeRequest, MetaRequest, Payload, PipelineError,
    RequestPipeline,
};
use tessera_meta_store::{
    DoubleBuffer, DurableStore, FlushError, LockKind, MetaStore, MetaStoreError,
    MetaStoreResult, MetadataManager, TableId, WriteBatch,
};

struct SwitchableStore {
    inner: MetaStore,
    broken: AtomicBool,
}

impl DurableStore for SwitchableStore {
    fn get(&self, table: TableId, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn scan_prefix(&self, table: TableId, prefix: &str) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(table, prefix)
    }

    fn commit(&self, batch: &WriteBatch) -> MetaStoreResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Unavailable("device removed".into()));
        }
        self.inner.commit(batch)
    }

    fn applied_index(&self) -> MetaStoreResult<Option<u64>> {
        self.inner.applied_index()
    }
}

fn pipeline() -> (TempDir, Arc<SwitchableStore>, Arc<RequestPipeline>) {
    let dir = tempdir().unwrap();
    let store = Arc::new(SwitchableStore {
        inner: MetaStore::open(dir.path().join("meta.redb")).unwrap(),
        broken: AtomicBool::new(false),
    });
    let manager = Arc::new(MetadataManager::new(
        store.clone() as Arc<dyn DurableStore>,
        Duration::from_secs(5),
    ));
    let buffer = Arc::new(DoubleBuffer::new(Arc::clone(&manager), FlushConfig::default()).unwrap());
    let pipeline = RequestPipeline::new(manager, buffer, LimitsConfig::default());
    (dir, store, Arc::new(pipeline))
}

fn create_s3(pipeline: &RequestPipeline, user: &str, bucket: &str, index: u64) -> Payload {
    let request = pipeline
        .pre_execute(
            MetaRequest::CreateS3Bucket(CreateS3BucketRequest::new(user, bucket)),
            &UserInfo::new(user),
        )
        .unwrap();
    let applied = pipeline.apply(&request, index).unwrap();
    match applied.response.result_code() {
        None => applied.response.payload,
        Some(code) => {
            assert_eq!(code, ResultCode::S3BucketAlreadyExists);
            Payload::Empty
        }
    }
}

#[test]
fn test_distinct_names_apply_in_parallel() {
    let (_dir, _store, pipeline) = pipeline();

    thread::scope(|s| {
        for i in 0..8u64 {
            let pipeline = &pipeline;
            s.spawn(move || {
                let user = format!("user{i}");
                let payload = create_s3(pipeline, &user, &format!("bucket-{i}"), i + 1);
                assert!(matches!(payload, Payload::S3Bucket { .. }));
            });
        }
    });

    let metrics = pipeline.metrics();
    assert_eq!(metrics.num_s3_buckets(), 8);
    assert_eq!(metrics.num_volumes(), 8);
    assert_eq!(pipeline.buffer().pending(), 8);
    assert_eq!(pipeline.buffer().flush_now().unwrap(), 8);
    assert_eq!(pipeline.manager().applied_index().unwrap(), Some(8));
}

#[test]
fn test_same_name_is_created_once() {
    let (_dir, _store, pipeline) = pipeline();

    let payloads: Vec<Payload> = thread::scope(|s| {
        let handles: Vec<_> = ["alice", "bob", "carol", "dave"]
            .into_iter()
            .zip(1u64..)
            .map(|(user, index)| {
                let pipeline = &pipeline;
                s.spawn(move || create_s3(pipeline, user, "shared", index))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = payloads
        .iter()
        .filter_map(|p| match p {
            Payload::S3Bucket { mapping, .. } => Some(mapping.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1, "{payloads:?}");
    assert_eq!(
        pipeline.manager().s3_table().get("shared").unwrap(),
        Some(winners[0].clone())
    );
    assert_eq!(pipeline.metrics().num_s3_buckets(), 1);
    assert_eq!(pipeline.metrics().num_buckets(), 1);
}

#[test]
fn test_overlapping_lock_plans_do_not_deadlock() {
    let (_dir, _store, pipeline) = pipeline();
    let caller = UserInfo::new("alice");

    thread::scope(|s| {
        let p = &pipeline;
        let caller = &caller;
        s.spawn(move || {
            for i in 0..20u64 {
                let request = p
                    .pre_execute(
                        MetaRequest::CreateVolume(CreateVolumeRequest::new(
                            format!("vol{i}"),
                            "alice",
                        )),
                        caller,
                    )
                    .unwrap();
                assert!(p.apply(&request, i * 2 + 1).unwrap().response.is_ok());
            }
        });
        s.spawn(move || {
            for i in 0..20u64 {
                let request = p
                    .pre_execute(
                        MetaRequest::CreateS3Bucket(CreateS3BucketRequest::new(
                            "alice",
                            format!("bucket-{i}"),
                        )),
                        caller,
                    )
                    .unwrap();
                assert!(p.apply(&request, i * 2 + 2).unwrap().response.is_ok());
            }
        });
    });

    let owned = pipeline
        .manager()
        .user_table()
        .get(&MetadataManager::user_key("alice"))
        .unwrap()
        .unwrap();
    // twenty plain volumes plus the implicit S3 volume
    assert_eq!(owned.len(), 21);
    assert_eq!(pipeline.metrics().num_volumes(), 21);
}

#[test]
fn test_apply_waits_out_held_bucket_lock() {
    let dir = tempdir().unwrap();
    let mut config = MetaConfig::default();
    config.store.db_path = dir.path().join("meta.redb");
    config.lock.acquire_timeout_ms = 100;
    let pipeline = RequestPipeline::open(&config).unwrap();
    let request = pipeline
        .pre_execute(
            MetaRequest::CreateS3Bucket(CreateS3BucketRequest::new("alice", "logs")),
            &UserInfo::new("alice"),
        )
        .unwrap();

    let held = pipeline.manager().lock().scope();
    let guard = held
        .acquire_write(LockKind::Bucket, &["s3alice", "logs"])
        .unwrap();

    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let pipeline = &pipeline;
        let request = &request;
        s.spawn(move || {
            let applied = pipeline.apply(request, 1).unwrap();
            tx.send(applied.response).unwrap();
        });

        // Well past the configured timeout
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        drop(guard);
        let resp = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(resp.is_ok(), "{resp:?}");
        assert_eq!(resp.writes.len(), 4);
    });

    assert!(pipeline.manager().s3_table().exists("logs").unwrap());
    assert!(
        pipeline
            .manager()
            .bucket_table()
            .exists(&MetadataManager::bucket_key("s3alice", "logs"))
            .unwrap()
    );
    assert_eq!(pipeline.metrics().num_s3_buckets(), 1);
}

#[test]
fn test_halted_pipeline_refuses_entries() {
    let (_dir, store, pipeline) = pipeline();

    let first = create_s3_applied(&pipeline, "logs", 1);
    store.broken.store(true, Ordering::SeqCst);

    assert!(matches!(
        pipeline.buffer().flush_now(),
        Err(FlushError::Persist(_))
    ));
    assert_eq!(first.wait(), Err(FlushError::Halted));
    assert!(pipeline.buffer().is_halted());

    let request = pipeline
        .pre_execute(
            MetaRequest::CreateS3Bucket(CreateS3BucketRequest::new("alice", "data")),
            &UserInfo::new("alice"),
        )
        .unwrap();
    assert_eq!(
        pipeline.apply(&request, 2).unwrap_err(),
        PipelineError::Halted { index: 2 }
    );
    // Unflushed state stays visible to reads
    assert!(pipeline.manager().s3_table().exists("logs").unwrap());
    assert!(!pipeline.manager().s3_table().exists("data").unwrap());
}

fn create_s3_applied(
    pipeline: &RequestPipeline,
    bucket: &str,
    index: u64,
) -> tessera_meta_store::FlushFuture {
    let request = pipeline
        .pre_execute(
            MetaRequest::CreateS3Bucket(CreateS3BucketRequest::new("alice", bucket)),
            &UserInfo::new("alice"),
        )
        .unwrap();
    let applied = pipeline.apply(&request, index).unwrap();
    assert!(applied.response.is_ok());
    applied.flush
}
