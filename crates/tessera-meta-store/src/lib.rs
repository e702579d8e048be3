//! Tessera Metadata Store
//!
//! In-memory versioned tables backed by redb, the hierarchical lock
//! manager that guards them, and the double-buffer engine that persists
//! applied results in batches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   Request pipeline   │  (tessera-meta-apply)
//! └──────────┬───────────┘
//!            │ lock → lookup → stage
//! ┌──────────▼───────────┐      ┌──────────────────┐
//! │   MetadataManager    │      │   DoubleBuffer   │
//! │  - LockManager       │◄─────┤  active/flushing │
//! │  - VersionedTable(s) │ evict│  FlushFuture(s)  │
//! └──────────┬───────────┘      └────────┬─────────┘
//!            │ miss                      │ WriteBatch
//! ┌──────────▼───────────────────────────▼─────────┐
//! │               DurableStore (redb)              │
//! └────────────────────────────────────────────────┘
//! ```

pub mod double_buffer;
pub mod lock;
pub mod manager;
pub mod store;
pub mod table;
pub mod tables;
pub mod types;

// Re-exports
pub use double_buffer::{DoubleBuffer, FlushError, FlushFuture, FlushSlot, FlushStatsSnapshot};
pub use lock::{LockError, LockGuard, LockKind, LockManager, LockMode, LockScope};
pub use manager::MetadataManager;
pub use store::{DurableStore, MetaStore, MetaStoreError, MetaStoreResult, WriteBatch};
pub use table::{CacheValue, Lookup, StagedWrite, VersionedTable};
pub use tables::TableId;
pub use types::{Acl, AclIdentityType, AclRight, BucketRecord, OwnerVolumes, VolumeRecord};
