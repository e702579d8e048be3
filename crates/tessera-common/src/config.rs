//! Configuration types for Tessera
//!
//! All sections implement `Default` and deserialize with `#[serde(default)]`
//! so a partial TOML file (or environment overrides) is enough.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the metadata service
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Durable store configuration
    pub store: StoreConfig,
    /// Double-buffer flush configuration
    pub flush: FlushConfig,
    /// Per-owner limits and naming
    pub limits: LimitsConfig,
    /// Lock manager configuration
    pub lock: LockConfig,
}

/// Durable store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/tessera/meta.redb"),
        }
    }
}

/// Double-buffer flush configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Swap and flush once the active buffer holds this many entries
    pub max_batch_entries: usize,
    /// Flush at least this often while entries are pending
    pub flush_interval_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_batch_entries: 1000,
            flush_interval_ms: 10,
        }
    }
}

impl FlushConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Per-owner limits and naming
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of volumes a single owner may hold
    pub max_user_volume_count: usize,
    /// Prefix of the volume implicitly created for an S3 user
    pub s3_volume_prefix: String,
    /// Quota assigned to implicitly created volumes
    pub default_volume_quota_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_user_volume_count: 1024,
            s3_volume_prefix: "s3".to_string(),
            default_volume_quota_bytes: u64::MAX,
        }
    }
}

/// Lock manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Give up waiting for a lock after this long, outside of apply
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MetaConfig::default();
        assert_eq!(config.limits.max_user_volume_count, 1024);
        assert_eq!(config.limits.s3_volume_prefix, "s3");
        assert_eq!(config.flush.flush_interval(), Duration::from_millis(10));
        assert_eq!(config.lock.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MetaConfig =
            serde_json::from_str(r#"{"limits": {"max_user_volume_count": 2}}"#).unwrap();
        assert_eq!(config.limits.max_user_volume_count, 2);
        assert_eq!(config.limits.s3_volume_prefix, "s3");
        assert_eq!(config.flush.max_batch_entries, 1000);
    }
}
