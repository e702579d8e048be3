//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;
use std::fmt;

// Entity tables. Values are bincode-encoded `(version, record)` pairs.
pub const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub const S3_MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("s3_mappings");

// Key: "applied_index", Value: highest log index whose batch was committed
pub const TRANSACTION_INFO: TableDefinition<&str, u64> = TableDefinition::new("transaction_info");
pub const APPLIED_INDEX_KEY: &str = "applied_index";

/// Entity tables that take part in the apply framework
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Volumes,
    Buckets,
    Users,
    S3Mappings,
}

impl TableId {
    pub const ALL: [Self; 4] = [Self::Volumes, Self::Buckets, Self::Users, Self::S3Mappings];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Volumes => "volumes",
            Self::Buckets => "buckets",
            Self::Users => "users",
            Self::S3Mappings => "s3_mappings",
        }
    }

    pub(crate) const fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Volumes => VOLUMES,
            Self::Buckets => BUCKETS,
            Self::Users => USERS,
            Self::S3Mappings => S3_MAPPINGS,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
