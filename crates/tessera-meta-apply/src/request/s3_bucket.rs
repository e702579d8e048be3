//! S3 bucket requests.
//!
//! An S3 bucket is a flat, globally unique name mapped onto a bucket inside
//! a per-user volume (`<prefix><user>`). The mapping table is the
//! uniqueness gate: its lock is taken first and held for the whole apply.

use super::volume::{add_volume_to_owner, stage_new_volume};
use super::{LockStep, RequestKind, default_acls, params};
use crate::audit::AuditAction;
use crate::context::{Applied, ApplyContext, ClientResultExt, PreExecuteContext, Staged, Step};
use crate::replay::is_replay;
use crate::response::{CommandType, Payload, SideEffect};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_common::config::LimitsConfig;
use tessera_common::{
    Error, KEY_PREFIX, Result, StorageType, UserInfo, s3_bucket_length_ok, validate_name,
};
use tessera_meta_store::{BucketRecord, LockKind, LockMode, Lookup, MetadataManager, VolumeRecord};
use tracing::{debug, error};

/// Admin recorded on volumes created implicitly for S3 users
pub const S3_ADMIN_NAME: &str = "tessera-s3";

/// Volume backing the S3 buckets of `user`
pub fn s3_volume_name(limits: &LimitsConfig, user: &str) -> String {
    format!("{}{user}", limits.s3_volume_prefix)
}

/// Mapping value stored for an S3 bucket: `volume/bucket`
pub fn s3_mapping_name(volume: &str, bucket: &str) -> String {
    format!("{volume}{KEY_PREFIX}{bucket}")
}

fn split_mapping(mapping: &str) -> Option<(&str, &str)> {
    mapping
        .split_once(KEY_PREFIX)
        .filter(|(v, b)| !v.is_empty() && !b.is_empty())
}

fn check_s3_name(s3_bucket: &str) -> Result<()> {
    if s3_bucket_length_ok(s3_bucket.len()) {
        Ok(())
    } else {
        Err(Error::InvalidS3BucketLength {
            name: s3_bucket.to_string(),
            length: s3_bucket.len(),
        })
    }
}

fn mapping_corrupt(s3_bucket: &str, bucket_key: impl Into<String>) -> Error {
    let err = Error::S3MappingTargetMissing {
        s3_bucket: s3_bucket.to_string(),
        bucket_key: bucket_key.into(),
    };
    error!("{err}");
    err
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateS3BucketRequest {
    pub user: String,
    pub s3_bucket: String,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl CreateS3BucketRequest {
    pub fn new(user: impl Into<String>, s3_bucket: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            s3_bucket: s3_bucket.into(),
            creation_time: 0,
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _s3_lock = locks
            .acquire_write(LockKind::S3Bucket, &[self.s3_bucket.as_str()])
            .client_err()?;

        match manager.s3_table().lookup(&self.s3_bucket).client_err()? {
            Lookup::Present { value: mapping, .. } => {
                let Some((volume, bucket)) = split_mapping(&mapping) else {
                    return Err(mapping_corrupt(&self.s3_bucket, mapping.clone()));
                };
                let bucket_key = MetadataManager::bucket_key(volume, bucket);
                let Some(existing) = manager.bucket_table().get(&bucket_key).client_err()? else {
                    return Err(mapping_corrupt(&self.s3_bucket, bucket_key));
                };
                if is_replay(existing.update_id, ctx.index) {
                    debug!(
                        "Replayed transaction {} ignored: create S3 bucket {}",
                        ctx.index, self.s3_bucket
                    );
                    return Ok(Step::Replay);
                }
                return Err(Error::S3BucketAlreadyExists(self.s3_bucket.clone()));
            }
            // Created and deleted again after this entry
            Lookup::Deleted { version } if is_replay(version, ctx.index) => {
                debug!(
                    "Replayed transaction {} ignored: S3 bucket {} deleted at {}",
                    ctx.index, self.s3_bucket, version
                );
                return Ok(Step::Replay);
            }
            Lookup::Deleted { .. } | Lookup::Absent => {}
        }

        let volume = s3_volume_name(ctx.limits, &self.user);
        {
            let _volume_lock = locks
                .acquire_write(LockKind::Volume, &[volume.as_str()])
                .client_err()?;
            let _user_lock = locks
                .acquire_write(LockKind::User, &[self.user.as_str()])
                .client_err()?;

            let volume_key = MetadataManager::volume_key(&volume);
            if !manager.volume_table().exists(&volume_key).client_err()? {
                let user_key = MetadataManager::user_key(&self.user);
                let owned = manager.user_table().get(&user_key).client_err()?;
                let owned = add_volume_to_owner(
                    owned,
                    &volume,
                    &self.user,
                    ctx.limits.max_user_volume_count,
                    ctx.index,
                )?;
                let record = VolumeRecord {
                    volume: volume.clone(),
                    owner: self.user.clone(),
                    admin: S3_ADMIN_NAME.to_string(),
                    quota_in_bytes: ctx.limits.default_volume_quota_bytes,
                    creation_time: self.creation_time,
                    object_id: ctx.index,
                    update_id: ctx.index,
                    acls: default_acls(&self.user, None),
                };
                stage_new_volume(ctx, record, owned, staged)?;
                staged.side_effects.push(SideEffect::VolumeCreated {
                    volume: volume.clone(),
                    owner: self.user.clone(),
                });
            }
        }

        {
            let _bucket_lock = locks
                .acquire_write(LockKind::Bucket, &[volume.as_str(), self.s3_bucket.as_str()])
                .client_err()?;
            let bucket_key = MetadataManager::bucket_key(&volume, &self.s3_bucket);
            if manager.bucket_table().exists(&bucket_key).client_err()? {
                // A plain bucket with this name already lives in the volume
                return Err(Error::BucketAlreadyExists(s3_mapping_name(
                    &volume,
                    &self.s3_bucket,
                )));
            }
            let record = BucketRecord {
                volume_name: volume.clone(),
                bucket_name: self.s3_bucket.clone(),
                is_version_enabled: false,
                storage_type: StorageType::default(),
                creation_time: self.creation_time,
                object_id: ctx.index,
                update_id: ctx.index,
                acls: default_acls(&self.user, None),
            };
            staged.push(
                manager
                    .bucket_table()
                    .stage_put(&bucket_key, record, ctx.index)
                    .client_err()?,
            );
            staged.delta.buckets += 1;
        }

        let mapping = s3_mapping_name(&volume, &self.s3_bucket);
        staged.push(
            manager
                .s3_table()
                .stage_put(&self.s3_bucket, mapping.clone(), ctx.index)
                .client_err()?,
        );
        staged.delta.s3_buckets += 1;

        Ok(Step::Done(Payload::S3Bucket {
            s3_bucket: self.s3_bucket.clone(),
            mapping,
        }))
    }
}

impl RequestKind for CreateS3BucketRequest {
    const CMD: CommandType = CommandType::CreateS3Bucket;
    const AUDIT_ACTION: AuditAction = AuditAction::CreateS3Bucket;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::S3Bucket, LockMode::Write),
        (LockKind::Volume, LockMode::Write),
        (LockKind::User, LockMode::Write),
        (LockKind::Bucket, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        check_s3_name(&self.s3_bucket)?;
        if self.user.is_empty() {
            return Err(Error::invalid_request("S3 bucket user must not be empty"));
        }
        let volume = s3_volume_name(ctx.limits, &self.user);
        validate_name(&volume).map_err(|reason| Error::InvalidVolumeName {
            name: volume.clone(),
            reason,
        })?;
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
            ("user", self.user.as_str()),
            ("s3_bucket", self.s3_bucket.as_str()),
        ])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteS3BucketRequest {
    pub s3_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl DeleteS3BucketRequest {
    pub fn new(s3_bucket: impl Into<String>) -> Self {
        Self {
            s3_bucket: s3_bucket.into(),
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _s3_lock = locks
            .acquire_write(LockKind::S3Bucket, &[self.s3_bucket.as_str()])
            .client_err()?;

        let lookup = manager.s3_table().lookup(&self.s3_bucket).client_err()?;
        if lookup.version().is_some_and(|v| is_replay(v, ctx.index)) {
            debug!(
                "Replayed transaction {} ignored: delete S3 bucket {}",
                ctx.index, self.s3_bucket
            );
            return Ok(Step::Replay);
        }
        let Some(mapping) = lookup.into_value() else {
            return Err(Error::S3BucketNotFound(self.s3_bucket.clone()));
        };
        let Some((volume, bucket)) = split_mapping(&mapping) else {
            return Err(mapping_corrupt(&self.s3_bucket, mapping.clone()));
        };

        {
            let _bucket_lock = locks
                .acquire_write(LockKind::Bucket, &[volume, bucket])
                .client_err()?;
            let bucket_key = MetadataManager::bucket_key(volume, bucket);
            if !manager.bucket_table().exists(&bucket_key).client_err()? {
                return Err(mapping_corrupt(&self.s3_bucket, bucket_key));
            }
            staged.push(
                manager
                    .bucket_table()
                    .stage_delete(&bucket_key, ctx.index)
                    .client_err()?,
            );
            staged.delta.buckets -= 1;
        }

        staged.push(
            manager
                .s3_table()
                .stage_delete(&self.s3_bucket, ctx.index)
                .client_err()?,
        );
        staged.delta.s3_buckets -= 1;

        Ok(Step::Done(Payload::S3Bucket {
            s3_bucket: self.s3_bucket.clone(),
            mapping,
        }))
    }
}

impl RequestKind for DeleteS3BucketRequest {
    const CMD: CommandType = CommandType::DeleteS3Bucket;
    const AUDIT_ACTION: AuditAction = AuditAction::DeleteS3Bucket;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::S3Bucket, LockMode::Write),
        (LockKind::Bucket, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        check_s3_name(&self.s3_bucket)?;
        self.caller = Some(ctx.caller.clone());
        Ok(self)
    }

    fn apply(&self, ctx: &ApplyContext<'_>) -> Applied {
        let mut staged = Staged::default();
        let result = self.apply_locked(ctx, &mut staged);
        Applied::finish(Self::CMD, result, staged)
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        params([("s3_bucket", self.s3_bucket.as_str())])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}
