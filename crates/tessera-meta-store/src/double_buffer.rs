//! Double-buffer flush engine.
//!
//! Applied requests append their staged writes to the *active* buffer and
//! get a [`FlushFuture`] back. A flush swaps the active buffer for an empty
//! one inside a short critical section, sorts the swapped (*flushing*)
//! buffer by log index and commits it to the durable store as one
//! [`WriteBatch`]. Only then are overlay entries evicted and futures
//! resolved, in log-index order.
//!
//! An apply reserves its slot with [`DoubleBuffer::reserve`] before it
//! takes any lock. Entries at or above the lowest index still reserved are
//! held back, so two applies touching the same key always land in the same
//! batch or in batches committed in index order.
//!
//! A failed commit is not recoverable: the cache would diverge from the
//! durable store. The engine halts, fails every pending and future
//! submission with [`FlushError::Halted`], and the flush loop exits.

use crate::manager::MetadataManager;
use crate::store::{MetaStoreResult, WriteBatch};
use crate::table::StagedWrite;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tessera_common::config::FlushConfig;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Errors surfaced through [`FlushFuture`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("durable write failed: {0}")]
    Persist(String),
    #[error("flush engine halted after a durable write failure")]
    Halted,
    #[error("flush completion dropped before the entry was persisted")]
    Dropped,
}

type FlushResult = Result<u64, FlushError>;

/// Completion handle for one applied entry.
///
/// Resolves to the entry's log index once its batch is durable.
#[derive(Debug)]
#[must_use = "dropping a FlushFuture discards the durability signal"]
pub struct FlushFuture {
    rx: oneshot::Receiver<FlushResult>,
}

impl FlushFuture {
    /// A future that is already resolved
    pub fn ready(result: FlushResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block the current thread until the entry is durable.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> FlushResult {
        self.rx.blocking_recv().unwrap_or(Err(FlushError::Dropped))
    }
}

impl Future for FlushFuture {
    type Output = FlushResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(FlushError::Dropped)))
    }
}

struct PendingFlush {
    index: u64,
    writes: Vec<StagedWrite>,
    done: oneshot::Sender<FlushResult>,
}

/// State guarded by the swap critical section
#[derive(Default)]
struct Active {
    entries: Vec<PendingFlush>,
    /// Reserved indices not yet completed, with multiplicity
    reserved: BTreeMap<u64, usize>,
}

impl Active {
    fn release(&mut self, index: u64) {
        if let Some(count) = self.reserved.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                self.reserved.remove(&index);
            }
        }
    }

    /// Take every entry below the lowest outstanding reservation
    fn take_ready(&mut self) -> Vec<PendingFlush> {
        match self.reserved.keys().next() {
            None => mem::take(&mut self.entries),
            Some(&watermark) => {
                let (ready, held) = mem::take(&mut self.entries)
                    .into_iter()
                    .partition(|p| p.index < watermark);
                self.entries = held;
                ready
            }
        }
    }
}

#[derive(Debug, Default)]
struct FlushStats {
    batches: AtomicU64,
    entries: AtomicU64,
    max_batch_size: AtomicUsize,
}

/// Point-in-time copy of the flush counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    pub batches: u64,
    pub entries: u64,
    pub max_batch_size: usize,
    pub flushed_index: u64,
}

/// Slot reserved for the entry being applied at `index`.
///
/// Dropping the slot without completing it withdraws the reservation.
#[must_use = "an uncompleted slot is withdrawn on drop"]
pub struct FlushSlot<'b> {
    buffer: &'b DoubleBuffer,
    index: u64,
    reserved: bool,
}

impl FlushSlot<'_> {
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Hand the entry's writes to the active buffer
    pub fn complete(mut self, writes: Vec<StagedWrite>) -> FlushFuture {
        if !self.reserved {
            return FlushFuture::ready(Err(FlushError::Halted));
        }
        self.reserved = false;
        self.buffer.push(self.index, writes)
    }
}

impl Drop for FlushSlot<'_> {
    fn drop(&mut self) {
        if self.reserved {
            self.buffer.current.lock().release(self.index);
        }
    }
}

/// Batches applied results and persists them off the apply path
pub struct DoubleBuffer {
    manager: Arc<MetadataManager>,
    config: FlushConfig,
    /// Active buffer; the mutex is only held to push or swap
    current: Mutex<Active>,
    /// Serializes flushes so batches commit in swap order
    flush_lock: Mutex<()>,
    notify: Notify,
    running: AtomicBool,
    halted: AtomicBool,
    flushed_index: AtomicU64,
    stats: FlushStats,
}

impl DoubleBuffer {
    /// Create a buffer resuming after the store's applied index.
    pub fn new(manager: Arc<MetadataManager>, config: FlushConfig) -> MetaStoreResult<Self> {
        let flushed_index = manager.applied_index()?.unwrap_or(0);
        Ok(Self {
            manager,
            current: Mutex::new(Active::default()),
            config,
            flush_lock: Mutex::new(()),
            notify: Notify::new(),
            running: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            flushed_index: AtomicU64::new(flushed_index),
            stats: FlushStats::default(),
        })
    }

    /// Reserve a slot for the entry about to be applied at `index`.
    pub fn reserve(&self, index: u64) -> FlushSlot<'_> {
        let mut current = self.current.lock();
        let reserved = !self.halted.load(Ordering::Acquire);
        if reserved {
            *current.reserved.entry(index).or_insert(0) += 1;
        }
        FlushSlot {
            buffer: self,
            index,
            reserved,
        }
    }

    /// Register the writes of the entry applied at `index`.
    pub fn add(&self, index: u64, writes: Vec<StagedWrite>) -> FlushFuture {
        self.reserve(index).complete(writes)
    }

    fn push(&self, index: u64, writes: Vec<StagedWrite>) -> FlushFuture {
        let (tx, rx) = oneshot::channel();
        let len = {
            let mut current = self.current.lock();
            current.release(index);
            if self.halted.load(Ordering::Acquire) {
                return FlushFuture::ready(Err(FlushError::Halted));
            }
            current.entries.push(PendingFlush {
                index,
                writes,
                done: tx,
            });
            current.entries.len()
        };

        if len >= self.config.max_batch_entries {
            self.notify.notify_one();
        }
        FlushFuture { rx }
    }

    /// Swap buffers and persist the swapped batch.
    ///
    /// Returns the number of entries flushed.
    pub fn flush_now(&self) -> Result<usize, FlushError> {
        let _flushing = self.flush_lock.lock();
        if self.is_halted() {
            return Err(FlushError::Halted);
        }

        let mut batch = self.current.lock().take_ready();
        if batch.is_empty() {
            return Ok(0);
        }
        batch.sort_by_key(|p| p.index);

        let mut write_batch = WriteBatch::new();
        for pending in &batch {
            for write in &pending.writes {
                write_batch.push(write.table, write.key.clone(), write.value.clone());
            }
        }
        let batch_max = batch.last().map_or(0, |p| p.index);
        let applied = self.flushed_index.load(Ordering::Acquire).max(batch_max);
        write_batch.set_applied_index(applied);

        if let Err(e) = self.manager.store().commit(&write_batch) {
            error!(
                "Durable write of {} entries (indices {}..={}) failed, halting: {}",
                batch.len(),
                batch.first().map_or(0, |p| p.index),
                batch_max,
                e
            );
            for pending in batch {
                let _ = pending.done.send(Err(FlushError::Halted));
            }
            self.halt();
            return Err(FlushError::Persist(e.to_string()));
        }

        let evicted = batch
            .iter()
            .flat_map(|p| &p.writes)
            .filter(|w| self.manager.evict_flushed(w))
            .count();
        self.flushed_index.store(applied, Ordering::Release);

        let count = batch.len();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.entries.fetch_add(count as u64, Ordering::Relaxed);
        self.stats.max_batch_size.fetch_max(count, Ordering::Relaxed);
        debug!(
            "Flushed {} entries ({} writes, {} evicted) up to index {}",
            count,
            write_batch.len(),
            evicted,
            batch_max
        );

        for pending in batch {
            // Receiver may have been dropped by a caller that does not wait
            let _ = pending.done.send(Ok(pending.index));
        }
        Ok(count)
    }

    /// Spawn the background flush loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Flush loop started (interval {:?}, max batch {})",
            self.config.flush_interval(),
            self.config.max_batch_entries
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.notify.notified() => {}
            }
            let stopping = !self.running.load(Ordering::Acquire);

            let engine = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || engine.flush_now()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!("Flush loop stopping: {e}");
                    break;
                }
                Err(e) => {
                    error!("Flush task failed: {e}");
                    self.halt();
                    break;
                }
            }

            if stopping {
                break;
            }
        }
        info!("Flush loop stopped");
    }

    /// Ask the flush loop to drain the active buffer and exit
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Entries waiting in the active buffer
    pub fn pending(&self) -> usize {
        self.current.lock().entries.len()
    }

    pub fn stats(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            batches: self.stats.batches.load(Ordering::Relaxed),
            entries: self.stats.entries.load(Ordering::Relaxed),
            max_batch_size: self.stats.max_batch_size.load(Ordering::Relaxed),
            flushed_index: self.flushed_index.load(Ordering::Acquire),
        }
    }

    fn halt(&self) {
        let drained = {
            let mut current = self.current.lock();
            self.halted.store(true, Ordering::Release);
            current.reserved.clear();
            mem::take(&mut current.entries)
        };
        for pending in drained {
            let _ = pending.done.send(Err(FlushError::Halted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TableId;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn engine(max_batch_entries: usize) -> (TempDir, Arc<MetadataManager>, Arc<DoubleBuffer>) {
        let dir = tempdir().unwrap();
        let manager = Arc::new(
            MetadataManager::open(dir.path().join("meta.redb"), Duration::from_secs(1)).unwrap(),
        );
        let config = FlushConfig {
            max_batch_entries,
            flush_interval_ms: 5,
        };
        let buffer = Arc::new(DoubleBuffer::new(Arc::clone(&manager), config).unwrap());
        (dir, manager, buffer)
    }

    fn stage(manager: &MetadataManager, key: &str, index: u64) -> Vec<StagedWrite> {
        vec![
            manager
                .s3_table()
                .stage_put(key, format!("s3alice/{key}"), index)
                .unwrap(),
        ]
    }

    #[test]
    fn test_flush_now_persists_and_evicts() {
        let (_dir, manager, buffer) = engine(100);
        let f1 = buffer.add(1, stage(&manager, "logs", 1));
        let f2 = buffer.add(2, stage(&manager, "data", 2));
        assert_eq!(buffer.pending(), 2);
        assert_eq!(manager.cached_entries(), 2);

        assert_eq!(buffer.flush_now().unwrap(), 2);
        assert_eq!(f1.wait(), Ok(1));
        assert_eq!(f2.wait(), Ok(2));

        assert_eq!(buffer.pending(), 0);
        assert_eq!(manager.cached_entries(), 0);
        assert!(
            manager
                .store()
                .get(TableId::S3Mappings, "logs")
                .unwrap()
                .is_some()
        );
        assert_eq!(manager.applied_index().unwrap(), Some(2));

        let stats = buffer.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.flushed_index, 2);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (_dir, manager, buffer) = engine(100);
        assert_eq!(buffer.flush_now().unwrap(), 0);
        assert_eq!(buffer.stats().batches, 0);
        assert_eq!(manager.applied_index().unwrap(), None);
    }

    #[test]
    fn test_applied_index_never_regresses() {
        let (_dir, manager, buffer) = engine(100);
        let f = buffer.add(9, stage(&manager, "late", 9));
        buffer.flush_now().unwrap();
        assert_eq!(f.wait(), Ok(9));

        let f = buffer.add(7, stage(&manager, "early", 7));
        buffer.flush_now().unwrap();
        assert_eq!(f.wait(), Ok(7));
        assert_eq!(manager.applied_index().unwrap(), Some(9));
    }

    #[test]
    fn test_reservation_holds_back_later_entries() {
        let (_dir, manager, buffer) = engine(100);
        let slot = buffer.reserve(4);
        let f5 = buffer.add(5, stage(&manager, "data", 5));
        let f3 = buffer.add(3, stage(&manager, "logs", 3));

        // Only index 3 is below the outstanding reservation
        assert_eq!(buffer.flush_now().unwrap(), 1);
        assert_eq!(f3.wait(), Ok(3));
        assert_eq!(buffer.pending(), 1);

        let f4 = slot.complete(stage(&manager, "tmp", 4));
        assert_eq!(buffer.flush_now().unwrap(), 2);
        assert_eq!(f4.wait(), Ok(4));
        assert_eq!(f5.wait(), Ok(5));
        assert_eq!(manager.applied_index().unwrap(), Some(5));
    }

    #[test]
    fn test_dropped_slot_is_withdrawn() {
        let (_dir, manager, buffer) = engine(100);
        drop(buffer.reserve(1));
        let f = buffer.add(2, stage(&manager, "logs", 2));
        assert_eq!(buffer.flush_now().unwrap(), 1);
        assert_eq!(f.wait(), Ok(2));
    }

    #[tokio::test]
    async fn test_background_loop_resolves_futures() {
        let (_dir, manager, buffer) = engine(100);
        let handle = buffer.start();

        let f = buffer.add(1, stage(&manager, "logs", 1));
        let index = tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index, 1);

        buffer.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let (_dir, manager, buffer) = engine(100);
        let f = buffer.add(3, stage(&manager, "logs", 3));
        let handle = buffer.start();
        buffer.shutdown();
        handle.await.unwrap();
        assert_eq!(f.await, Ok(3));
        assert_eq!(manager.cached_entries(), 0);
    }
}
