use super::{LockStep, RequestKind, default_acls, params};
use crate::audit::AuditAction;
use crate::context::{Applied, ApplyContext, ClientResultExt, PreExecuteContext, Staged, Step};
use crate::replay::is_replay_of;
use crate::response::{CommandType, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_common::{Error, Result, StorageType, UserInfo, validate_name};
use tessera_meta_store::{BucketRecord, LockKind, LockMode, MetadataManager};
use tracing::debug;

fn validate_bucket_path(volume: &str, bucket: &str) -> Result<()> {
    validate_name(volume).map_err(|reason| Error::InvalidVolumeName {
        name: volume.to_string(),
        reason,
    })?;
    validate_name(bucket).map_err(|reason| Error::InvalidBucketName {
        name: bucket.to_string(),
        reason,
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBucketRequest {
    pub volume: String,
    pub bucket: String,
    #[serde(default)]
    pub is_version_enabled: bool,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl CreateBucketRequest {
    pub fn new(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
            is_version_enabled: false,
            storage_type: StorageType::default(),
            creation_time: 0,
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _volume_lock = locks
            .acquire_read(LockKind::Volume, &[self.volume.as_str()])
            .client_err()?;
        let _bucket_lock = locks
            .acquire_write(LockKind::Bucket, &[self.volume.as_str(), self.bucket.as_str()])
            .client_err()?;

        let bucket_key = MetadataManager::bucket_key(&self.volume, &self.bucket);
        let existing = manager.bucket_table().lookup(&bucket_key).client_err()?;
        if is_replay_of(existing.version(), ctx.index) {
            debug!(
                "Replayed transaction {} ignored: create bucket {}",
                ctx.index, bucket_key
            );
            return Ok(Step::Replay);
        }

        let volume_key = MetadataManager::volume_key(&self.volume);
        let Some(volume) = manager.volume_table().get(&volume_key).client_err()? else {
            return Err(Error::VolumeNotFound(self.volume.clone()));
        };
        if existing.is_present() {
            return Err(Error::BucketAlreadyExists(format!(
                "{}/{}",
                self.volume, self.bucket
            )));
        }

        let record = BucketRecord {
            volume_name: self.volume.clone(),
            bucket_name: self.bucket.clone(),
            is_version_enabled: self.is_version_enabled,
            storage_type: self.storage_type,
            creation_time: self.creation_time,
            object_id: ctx.index,
            update_id: ctx.index,
            acls: default_acls(&volume.owner, Some(&volume.admin)),
        };
        staged.push(
            manager
                .bucket_table()
                .stage_put(&bucket_key, record, ctx.index)
                .client_err()?,
        );
        staged.delta.buckets += 1;

        Ok(Step::Done(Payload::Bucket {
            volume: self.volume.clone(),
            bucket: self.bucket.clone(),
        }))
    }
}

impl RequestKind for CreateBucketRequest {
    const CMD: CommandType = CommandType::CreateBucket;
    const AUDIT_ACTION: AuditAction = AuditAction::CreateBucket;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::Volume, LockMode::Read),
        (LockKind::Bucket, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        validate_bucket_path(&self.volume, &self.bucket)?;
        self.creation_time = ctx.clock.now_millis();
        self.caller = Some(ctx.caller.clone());
        Ok(self)
    }

    fn apply(&self, ctx: &ApplyContext<'_>) -> Applied {
        let mut staged = Staged::default();
        let result = self.apply_locked(ctx, &mut staged);
        Applied::finish(Self::CMD, result, staged)
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        params([
            ("volume", self.volume.as_str()),
            ("bucket", self.bucket.as_str()),
            ("storage_type", &self.storage_type.to_string()),
        ])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBucketRequest {
    pub volume: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl DeleteBucketRequest {
    pub fn new(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _volume_lock = locks
            .acquire_read(LockKind::Volume, &[self.volume.as_str()])
            .client_err()?;
        let _bucket_lock = locks
            .acquire_write(LockKind::Bucket, &[self.volume.as_str(), self.bucket.as_str()])
            .client_err()?;

        let bucket_key = MetadataManager::bucket_key(&self.volume, &self.bucket);
        let existing = manager.bucket_table().lookup(&bucket_key).client_err()?;
        if is_replay_of(existing.version(), ctx.index) {
            debug!(
                "Replayed transaction {} ignored: delete bucket {}",
                ctx.index, bucket_key
            );
            return Ok(Step::Replay);
        }
        if !existing.is_present() {
            return Err(Error::BucketNotFound(format!(
                "{}/{}",
                self.volume, self.bucket
            )));
        }

        staged.push(
            manager
                .bucket_table()
                .stage_delete(&bucket_key, ctx.index)
                .client_err()?,
        );
        staged.delta.buckets -= 1;

        Ok(Step::Done(Payload::Bucket {
            volume: self.volume.clone(),
            bucket: self.bucket.clone(),
        }))
    }
}

impl RequestKind for DeleteBucketRequest {
    const CMD: CommandType = CommandType::DeleteBucket;
    const AUDIT_ACTION: AuditAction = AuditAction::DeleteBucket;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::Volume, LockMode::Read),
        (LockKind::Bucket, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        validate_bucket_path(&self.volume, &self.bucket)?;
        self.caller = Some(ctx.caller.clone());
        Ok(self)
    }

    fn apply(&self, ctx: &ApplyContext<'_>) -> Applied {
        let mut staged = Staged::default();
        let result = self.apply_locked(ctx, &mut staged);
        Applied::finish(Self::CMD, result, staged)
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        params([("volume", self.volume.as_str()), ("bucket", self.bucket.as_str())])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}
