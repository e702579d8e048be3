//! Hierarchical resource locks.
//!
//! Locks are per key and created on demand. Resource kinds have a fixed
//! global rank; within one [`LockScope`] a kind can only be acquired while
//! every kind still held has a strictly lower rank. All request kinds go
//! through a scope, so no two of them can wait on each other in a cycle.
//!
//! ```text
//! S3Bucket (0)  →  Volume (1)  →  User (2)  →  Bucket (3)
//! ```
//!
//! A committed entry must run to completion on every replica, so
//! [`LockManager::apply_scope`] waits without a deadline. The configured
//! timeout only bounds [`LockManager::scope`], used before commit.

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Number of tracked keys above which idle entries are pruned
const PRUNE_THRESHOLD: usize = 4096;

/// Lockable resource kinds, in global acquisition order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKind {
    /// Logical-name uniqueness gate
    S3Bucket,
    Volume,
    User,
    Bucket,
}

impl LockKind {
    pub const ALL: [Self; 4] = [Self::S3Bucket, Self::Volume, Self::User, Self::Bucket];

    pub const fn rank(self) -> u8 {
        match self {
            Self::S3Bucket => 0,
            Self::Volume => 1,
            Self::User => 2,
            Self::Bucket => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::S3Bucket => "S3_BUCKET_LOCK",
            Self::Volume => "VOLUME_LOCK",
            Self::User => "USER_LOCK",
            Self::Bucket => "BUCKET_LOCK",
        }
    }

    const fn bit(self) -> u8 {
        1 << self.rank()
    }

    const fn from_rank(rank: u32) -> Self {
        match rank {
            0 => Self::S3Bucket,
            1 => Self::Volume,
            2 => Self::User,
            _ => Self::Bucket,
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Errors raised while acquiring a lock
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("cannot acquire {requested} while holding {held}")]
    OrderViolation { requested: LockKind, held: LockKind },
    #[error("timed out acquiring {kind} on '{key}'")]
    Timeout { kind: LockKind, key: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LockKey {
    kind: LockKind,
    key: String,
}

/// Registry of per-key read/write locks
pub struct LockManager {
    locks: Mutex<HashMap<LockKey, Arc<RwLock<()>>>>,
    timeout: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Open a scope whose acquisitions give up after the configured timeout
    #[must_use]
    pub const fn scope(&self) -> LockScope<'_> {
        LockScope {
            manager: self,
            held: Cell::new(0),
            timeout: Some(self.timeout),
        }
    }

    /// Open a scope for applying a committed entry.
    ///
    /// Acquisitions block until granted and never fail with
    /// [`LockError::Timeout`]; the rank order rules out deadlock.
    #[must_use]
    pub const fn apply_scope(&self) -> LockScope<'_> {
        LockScope {
            manager: self,
            held: Cell::new(0),
            timeout: None,
        }
    }

    /// Number of keys with a lock entry
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().len()
    }

    /// Remove lock entries nobody holds. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    fn resource(&self, key: &LockKey) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

/// Locks taken on behalf of a single request.
///
/// Not `Sync`: a scope belongs to the thread applying the request.
pub struct LockScope<'m> {
    manager: &'m LockManager,
    held: Cell<u8>,
    timeout: Option<Duration>,
}

impl LockScope<'_> {
    pub fn acquire_read(&self, kind: LockKind, parts: &[&str]) -> Result<LockGuard<'_>, LockError> {
        self.acquire(kind, parts, LockMode::Read)
    }

    pub fn acquire_write(&self, kind: LockKind, parts: &[&str]) -> Result<LockGuard<'_>, LockError> {
        self.acquire(kind, parts, LockMode::Write)
    }

    /// Whether this scope currently holds a lock of `kind`
    pub fn holds(&self, kind: LockKind) -> bool {
        self.held.get() & kind.bit() != 0
    }

    fn acquire(
        &self,
        kind: LockKind,
        parts: &[&str],
        mode: LockMode,
    ) -> Result<LockGuard<'_>, LockError> {
        let blocking = self.held.get() >> kind.rank();
        if blocking != 0 {
            let held = LockKind::from_rank(u32::from(kind.rank()) + 7 - blocking.leading_zeros());
            warn!("Lock order violation: {kind} requested while holding {held}");
            return Err(LockError::OrderViolation {
                requested: kind,
                held,
            });
        }

        let key = LockKey {
            kind,
            key: parts.join("/"),
        };
        let lock = self.manager.resource(&key);
        let inner = match (mode, self.timeout) {
            (LockMode::Read, Some(timeout)) => lock.try_read_arc_for(timeout).map(GuardInner::Read),
            (LockMode::Write, Some(timeout)) => {
                lock.try_write_arc_for(timeout).map(GuardInner::Write)
            }
            (LockMode::Read, None) => Some(GuardInner::Read(lock.read_arc())),
            (LockMode::Write, None) => Some(GuardInner::Write(lock.write_arc())),
        }
        .ok_or_else(|| LockError::Timeout {
            kind,
            key: key.key.clone(),
        })?;

        self.held.set(self.held.get() | kind.bit());
        debug!("Acquired {:?} {} on '{}'", mode, kind, key.key);
        Ok(LockGuard {
            held: &self.held,
            kind,
            key: key.key,
            inner,
        })
    }
}

enum GuardInner {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Held lock; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'s> {
    held: &'s Cell<u8>,
    kind: LockKind,
    key: String,
    inner: GuardInner,
}

impl LockGuard<'_> {
    pub const fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.held.set(self.held.get() & !self.kind.bit());
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.inner {
            GuardInner::Read(_) => LockMode::Read,
            GuardInner::Write(_) => LockMode::Write,
        };
        f.debug_struct("LockGuard")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("mode", &mode)
            .finish()
    }
}
