//! Error types for Tessera
//!
//! Every error a client can observe carries a stable [`ResultCode`] and
//! belongs to one [`ErrorKind`], so operators can tell an expected conflict
//! apart from a cross-table inconsistency.

use crate::types::NameError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Client-facing error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Validation errors (raised before commit)
    #[error("S3 bucket name '{name}' must be at least 3 and less than 63 characters long, got {length}")]
    InvalidS3BucketLength { name: String, length: usize },

    #[error("invalid volume name '{name}': {reason}")]
    InvalidVolumeName { name: String, reason: NameError },

    #[error("invalid bucket name '{name}': {reason}")]
    InvalidBucketName { name: String, reason: NameError },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Conflict errors (raised at apply time)
    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(String),

    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("S3 bucket already exists: {0}")]
    S3BucketAlreadyExists(String),

    #[error("user '{user}' already owns the maximum of {max} volumes")]
    UserTooManyVolumes { user: String, max: usize },

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("S3 bucket not found: {0}")]
    S3BucketNotFound(String),

    #[error("volume is not empty: {0}")]
    VolumeNotEmpty(String),

    // Invariant violations
    #[error("S3 bucket '{s3_bucket}' mapping exists but bucket '{bucket_key}' does not")]
    S3MappingTargetMissing {
        s3_bucket: String,
        bucket_key: String,
    },

    // Internal errors
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable result codes surfaced in client responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    S3BucketInvalidLength,
    InvalidVolumeName,
    InvalidBucketName,
    InvalidRequest,
    VolumeAlreadyExists,
    BucketAlreadyExists,
    S3BucketAlreadyExists,
    UserTooManyVolumes,
    VolumeNotFound,
    BucketNotFound,
    S3BucketNotFound,
    VolumeNotEmpty,
    S3BucketMappingCorrupt,
    LockTimeout,
    InternalError,
}

impl ResultCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::S3BucketInvalidLength => "S3_BUCKET_INVALID_LENGTH",
            Self::InvalidVolumeName => "INVALID_VOLUME_NAME",
            Self::InvalidBucketName => "INVALID_BUCKET_NAME",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::VolumeAlreadyExists => "VOLUME_ALREADY_EXISTS",
            Self::BucketAlreadyExists => "BUCKET_ALREADY_EXISTS",
            Self::S3BucketAlreadyExists => "S3_BUCKET_ALREADY_EXISTS",
            Self::UserTooManyVolumes => "USER_TOO_MANY_VOLUMES",
            Self::VolumeNotFound => "VOLUME_NOT_FOUND",
            Self::BucketNotFound => "BUCKET_NOT_FOUND",
            Self::S3BucketNotFound => "S3_BUCKET_NOT_FOUND",
            Self::VolumeNotEmpty => "VOLUME_NOT_EMPTY",
            Self::S3BucketMappingCorrupt => "S3_BUCKET_MAPPING_CORRUPT",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before the entry reaches the log
    Validation,
    /// Expected conflict with current state, reported to the client
    Conflict,
    /// Tables disagree with each other; never repaired automatically
    InvariantViolation,
    /// Infrastructure failure while applying
    Internal,
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Result code reported to clients
    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        match self {
            Self::InvalidS3BucketLength { .. } => ResultCode::S3BucketInvalidLength,
            Self::InvalidVolumeName { .. } => ResultCode::InvalidVolumeName,
            Self::InvalidBucketName { .. } => ResultCode::InvalidBucketName,
            Self::InvalidRequest(_) => ResultCode::InvalidRequest,
            Self::VolumeAlreadyExists(_) => ResultCode::VolumeAlreadyExists,
            Self::BucketAlreadyExists(_) => ResultCode::BucketAlreadyExists,
            Self::S3BucketAlreadyExists(_) => ResultCode::S3BucketAlreadyExists,
            Self::UserTooManyVolumes { .. } => ResultCode::UserTooManyVolumes,
            Self::VolumeNotFound(_) => ResultCode::VolumeNotFound,
            Self::BucketNotFound(_) => ResultCode::BucketNotFound,
            Self::S3BucketNotFound(_) => ResultCode::S3BucketNotFound,
            Self::VolumeNotEmpty(_) => ResultCode::VolumeNotEmpty,
            Self::S3MappingTargetMissing { .. } => ResultCode::S3BucketMappingCorrupt,
            Self::LockTimeout(_) => ResultCode::LockTimeout,
            Self::Internal(_) => ResultCode::InternalError,
        }
    }

    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidS3BucketLength { .. }
            | Self::InvalidVolumeName { .. }
            | Self::InvalidBucketName { .. }
            | Self::InvalidRequest(_) => ErrorKind::Validation,

            Self::VolumeAlreadyExists(_)
            | Self::BucketAlreadyExists(_)
            | Self::S3BucketAlreadyExists(_)
            | Self::UserTooManyVolumes { .. }
            | Self::VolumeNotFound(_)
            | Self::BucketNotFound(_)
            | Self::S3BucketNotFound(_)
            | Self::VolumeNotEmpty(_) => ErrorKind::Conflict,

            Self::S3MappingTargetMissing { .. } => ErrorKind::InvariantViolation,

            Self::LockTimeout(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the client may retry the same request
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }

    /// Whether this error signals storage corruption
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvariantViolation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::InvalidS3BucketLength {
                name: "ab".into(),
                length: 2
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::S3BucketAlreadyExists("logs".into()).kind(),
            ErrorKind::Conflict
        );
        assert!(
            Error::S3MappingTargetMissing {
                s3_bucket: "logs".into(),
                bucket_key: "/s3alice/logs".into(),
            }
            .is_invariant_violation()
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::LockTimeout("VOLUME /v1".into()).is_retryable());
        assert!(!Error::S3BucketAlreadyExists("logs".into()).is_retryable());
        assert!(
            !Error::S3MappingTargetMissing {
                s3_bucket: "logs".into(),
                bucket_key: "/s3alice/logs".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_result_code_strings() {
        assert_eq!(
            Error::UserTooManyVolumes {
                user: "alice".into(),
                max: 1
            }
            .result_code()
            .as_str(),
            "USER_TOO_MANY_VOLUMES"
        );
        let json = serde_json::to_string(&ResultCode::S3BucketMappingCorrupt).unwrap();
        assert_eq!(json, "\"S3_BUCKET_MAPPING_CORRUPT\"");
    }
}
