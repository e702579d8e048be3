//! Core types for Tessera
//!
//! Name validation rules, caller identity and storage classes shared by
//! the metadata store and the request pipeline.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Minimum length of an S3 bucket name (inclusive)
pub const S3_BUCKET_MIN_LENGTH: usize = 3;

/// Maximum length of an S3 bucket name (exclusive)
pub const S3_BUCKET_MAX_LENGTH: usize = 63;

/// Minimum length of a volume or bucket name
pub const NAME_MIN_LENGTH: usize = 3;

/// Maximum length of a volume or bucket name
pub const NAME_MAX_LENGTH: usize = 63;

/// Separator used when building table keys
pub const KEY_PREFIX: &str = "/";

/// Errors that can occur when validating a volume or bucket name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must be at least {NAME_MIN_LENGTH} characters")]
    TooShort,
    #[error("name must be at most {NAME_MAX_LENGTH} characters")]
    TooLong,
    #[error("name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("name cannot contain consecutive periods")]
    ConsecutivePeriods,
}

/// Validate a volume or bucket name.
///
/// Names are 3-63 characters of lowercase ASCII letters, digits, `-` and
/// `.`, starting and ending with a letter or digit.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.len() < NAME_MIN_LENGTH {
        return Err(NameError::TooShort);
    }
    if name.len() > NAME_MAX_LENGTH {
        return Err(NameError::TooLong);
    }

    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    if !name.starts_with(is_alnum) {
        return Err(NameError::InvalidStartChar);
    }
    if !name.ends_with(is_alnum) {
        return Err(NameError::InvalidEndChar);
    }
    if let Some(c) = name.chars().find(|&c| !is_alnum(c) && c != '-' && c != '.') {
        return Err(NameError::InvalidChar(c));
    }
    if name.contains("..") {
        return Err(NameError::ConsecutivePeriods);
    }

    Ok(())
}

/// Check an S3 bucket name length against `[3, 63)`.
#[must_use]
pub const fn s3_bucket_length_ok(length: usize) -> bool {
    length >= S3_BUCKET_MIN_LENGTH && length < S3_BUCKET_MAX_LENGTH
}

/// Identity of the caller that submitted a request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

impl UserInfo {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            remote_address: None,
        }
    }

    #[must_use]
    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }
}

/// Storage medium requested for a bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    #[default]
    #[display("DISK")]
    Disk,
    #[display("SSD")]
    Ssd,
    #[display("ARCHIVE")]
    Archive,
    #[display("RAM_DISK")]
    RamDisk,
}
