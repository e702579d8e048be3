//! Client responses produced by the apply phase.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tessera_common::{Error, ResultCode};
use tessera_meta_store::StagedWrite;

/// Request kind a response answers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CommandType {
    CreateVolume,
    DeleteVolume,
    CreateBucket,
    DeleteBucket,
    CreateS3Bucket,
    DeleteS3Bucket,
}

impl CommandType {
    pub const ALL: [Self; 6] = [
        Self::CreateVolume,
        Self::DeleteVolume,
        Self::CreateBucket,
        Self::DeleteBucket,
        Self::CreateS3Bucket,
        Self::DeleteS3Bucket,
    ];

    /// Stable position in [`CommandType::ALL`]
    pub const fn ordinal(self) -> usize {
        match self {
            Self::CreateVolume => 0,
            Self::DeleteVolume => 1,
            Self::CreateBucket => 2,
            Self::DeleteBucket => 3,
            Self::CreateS3Bucket => 4,
            Self::DeleteS3Bucket => 5,
        }
    }

    /// snake_case label used in metrics
    pub const fn label(self) -> &'static str {
        match self {
            Self::CreateVolume => "create_volume",
            Self::DeleteVolume => "delete_volume",
            Self::CreateBucket => "create_bucket",
            Self::DeleteBucket => "delete_bucket",
            Self::CreateS3Bucket => "create_s3_bucket",
            Self::DeleteS3Bucket => "delete_s3_bucket",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Failed(ResultCode),
}

/// Command-specific result data.
///
/// Replayed entries carry [`Payload::Empty`]: the original payload was
/// already delivered when the entry was first applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Volume {
        volume: String,
    },
    Bucket {
        volume: String,
        bucket: String,
    },
    S3Bucket {
        s3_bucket: String,
        /// `volume/bucket` backing the S3 name
        mapping: String,
    },
}

/// Secondary mutation performed while applying a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    VolumeCreated { volume: String, owner: String },
}

/// Response returned to the caller for one applied log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub cmd: CommandType,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<SideEffect>,
    /// Cache mutations staged by this entry, in staging order
    #[serde(skip)]
    pub writes: Vec<StagedWrite>,
}

impl ClientResponse {
    pub const fn success(cmd: CommandType, payload: Payload) -> Self {
        Self {
            cmd,
            status: Status::Ok,
            message: None,
            payload,
            side_effects: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn error(cmd: CommandType, error: &Error) -> Self {
        Self {
            cmd,
            status: Status::Failed(error.result_code()),
            message: Some(error.to_string()),
            payload: Payload::Empty,
            side_effects: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Success-shaped response for a replayed entry
    pub const fn replay(cmd: CommandType) -> Self {
        Self::success(cmd, Payload::Empty)
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self.status, Status::Ok)
    }

    pub const fn result_code(&self) -> Option<ResultCode> {
        match self.status {
            Status::Ok => None,
            Status::Failed(code) => Some(code),
        }
    }
}
