//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode, wrapped together with
//! the log index that last wrote them (see [`crate::table`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tessera_common::StorageType;

// ---- ACLs ----

/// Kind of identity an ACL entry applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclIdentityType {
    User,
    Group,
    World,
}

impl AclIdentityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::World => "world",
        }
    }
}

/// A single permission bit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclRight {
    Read,
    Write,
    Create,
    List,
    Delete,
    ReadAcl,
    WriteAcl,
    All,
    None,
}

impl AclRight {
    const fn code(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
            Self::Create => 'c',
            Self::List => 'l',
            Self::Delete => 'd',
            Self::ReadAcl => 'x',
            Self::WriteAcl => 'y',
            Self::All => 'a',
            Self::None => 'n',
        }
    }

    const fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'r' => Self::Read,
            'w' => Self::Write,
            'c' => Self::Create,
            'l' => Self::List,
            'd' => Self::Delete,
            'x' => Self::ReadAcl,
            'y' => Self::WriteAcl,
            'a' => Self::All,
            'n' => Self::None,
            _ => return None,
        })
    }
}

/// Access control entry, written as `type:name:rights` (e.g. `user:alice:a`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub identity_type: AclIdentityType,
    pub name: String,
    pub rights: Vec<AclRight>,
}

/// Errors that can occur when parsing an ACL string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclParseError {
    #[error("ACL must have the form type:name:rights, got '{0}'")]
    Malformed(String),
    #[error("unknown ACL identity type: {0}")]
    UnknownType(String),
    #[error("unknown ACL right: {0}")]
    UnknownRight(char),
}

impl Acl {
    /// Full access for a single user
    pub fn user_all(name: impl Into<String>) -> Self {
        Self {
            identity_type: AclIdentityType::User,
            name: name.into(),
            rights: vec![AclRight::All],
        }
    }

    /// Parse a comma separated list such as `user:alice:a,user:admin:rw`
    pub fn parse_list(acls: &str) -> Result<Vec<Self>, AclParseError> {
        acls.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for Acl {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(kind), Some(name), Some(rights)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AclParseError::Malformed(s.to_string()));
        };

        let identity_type = match kind {
            "user" => AclIdentityType::User,
            "group" => AclIdentityType::Group,
            "world" => AclIdentityType::World,
            other => return Err(AclParseError::UnknownType(other.to_string())),
        };
        let rights = rights
            .chars()
            .map(|c| AclRight::from_code(c).ok_or(AclParseError::UnknownRight(c)))
            .collect::<Result<Vec<_>, _>>()?;
        if rights.is_empty() {
            return Err(AclParseError::Malformed(s.to_string()));
        }

        Ok(Self {
            identity_type,
            name: name.to_string(),
            rights,
        })
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.identity_type.as_str(), self.name)?;
        for right in &self.rights {
            write!(f, "{}", right.code())?;
        }
        Ok(())
    }
}

// ---- Entity records ----

/// Stored volume metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume: String,
    pub owner: String,
    pub admin: String,
    pub quota_in_bytes: u64,
    pub creation_time: u64,
    /// Log index of the creating transaction
    pub object_id: u64,
    /// Log index of the last modifying transaction
    pub update_id: u64,
    pub acls: Vec<Acl>,
}

/// Stored bucket metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub volume_name: String,
    pub bucket_name: String,
    pub is_version_enabled: bool,
    pub storage_type: StorageType,
    pub creation_time: u64,
    pub object_id: u64,
    pub update_id: u64,
    pub acls: Vec<Acl>,
}

/// Volumes owned by a single user, in insertion order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerVolumes {
    pub volume_names: Vec<String>,
    pub object_id: u64,
    pub update_id: u64,
}

impl OwnerVolumes {
    #[must_use]
    pub fn contains(&self, volume: &str) -> bool {
        self.volume_names.iter().any(|v| v == volume)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.volume_names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volume_names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_parse_list() {
        let acls = Acl::parse_list("user:alice:a, user:s3-admin:rw").unwrap();
        assert_eq!(acls.len(), 2);
        assert_eq!(acls[0], Acl::user_all("alice"));
        assert_eq!(acls[1].rights, vec![AclRight::Read, AclRight::Write]);
        assert_eq!(acls[1].to_string(), "user:s3-admin:rw");
    }

    #[test]
    fn test_acl_parse_errors() {
        assert!(matches!(
            "user:alice".parse::<Acl>(),
            Err(AclParseError::Malformed(_))
        ));
        assert!(matches!(
            "robot:alice:a".parse::<Acl>(),
            Err(AclParseError::UnknownType(_))
        ));
        assert_eq!(
            "user:alice:q".parse::<Acl>(),
            Err(AclParseError::UnknownRight('q'))
        );
    }

    #[test]
    fn test_owner_volumes() {
        let owned = OwnerVolumes {
            volume_names: vec!["s3alice".into()],
            object_id: 1,
            update_id: 1,
        };
        assert!(owned.contains("s3alice"));
        assert!(!owned.contains("s3bob"));
        assert_eq!(owned.len(), 1);
        assert!(OwnerVolumes::default().is_empty());
    }
}
