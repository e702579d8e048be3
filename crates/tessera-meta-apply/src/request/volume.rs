use super::{LockStep, RequestKind, default_acls, params};
use crate::audit::AuditAction;
use crate::context::{Applied, ApplyContext, ClientResultExt, PreExecuteContext, Staged, Step};
use crate::replay::is_replay_of;
use crate::response::{CommandType, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_common::{Error, Result, UserInfo, validate_name};
use tessera_meta_store::{LockKind, LockMode, MetadataManager, OwnerVolumes, VolumeRecord};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub volume: String,
    pub owner: String,
    /// Defaults to the owner
    #[serde(default)]
    pub admin: Option<String>,
    /// Defaults to the configured volume quota
    #[serde(default)]
    pub quota_in_bytes: Option<u64>,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl CreateVolumeRequest {
    pub fn new(volume: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            owner: owner.into(),
            admin: None,
            quota_in_bytes: None,
            creation_time: 0,
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _volume_lock = locks
            .acquire_write(LockKind::Volume, &[self.volume.as_str()])
            .client_err()?;

        let volume_key = MetadataManager::volume_key(&self.volume);
        let existing = manager.volume_table().lookup(&volume_key).client_err()?;
        if is_replay_of(existing.version(), ctx.index) {
            debug!(
                "Replayed transaction {} ignored: create volume {}",
                ctx.index, self.volume
            );
            return Ok(Step::Replay);
        }
        if existing.is_present() {
            return Err(Error::VolumeAlreadyExists(self.volume.clone()));
        }

        let _user_lock = locks
            .acquire_write(LockKind::User, &[self.owner.as_str()])
            .client_err()?;
        let user_key = MetadataManager::user_key(&self.owner);
        let owned = manager.user_table().get(&user_key).client_err()?;
        let owned = add_volume_to_owner(
            owned,
            &self.volume,
            &self.owner,
            ctx.limits.max_user_volume_count,
            ctx.index,
        )?;

        let admin = self.admin.clone().unwrap_or_else(|| self.owner.clone());
        let record = VolumeRecord {
            volume: self.volume.clone(),
            owner: self.owner.clone(),
            acls: default_acls(&self.owner, Some(&admin)),
            admin,
            quota_in_bytes: self
                .quota_in_bytes
                .unwrap_or(ctx.limits.default_volume_quota_bytes),
            creation_time: self.creation_time,
            object_id: ctx.index,
            update_id: ctx.index,
        };
        stage_new_volume(ctx, record, owned, staged)?;

        Ok(Step::Done(Payload::Volume {
            volume: self.volume.clone(),
        }))
    }
}

impl RequestKind for CreateVolumeRequest {
    const CMD: CommandType = CommandType::CreateVolume;
    const AUDIT_ACTION: AuditAction = AuditAction::CreateVolume;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::Volume, LockMode::Write),
        (LockKind::User, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        validate_name(&self.volume).map_err(|reason| Error::InvalidVolumeName {
            name: self.volume.clone(),
            reason,
        })?;
        if self.owner.is_empty() {
            return Err(Error::invalid_request("volume owner must not be empty"));
        }
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
        params([("volume", self.volume.as_str()), ("owner", self.owner.as_str())])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserInfo>,
}

impl DeleteVolumeRequest {
    pub fn new(volume: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            caller: None,
        }
    }

    fn apply_locked(&self, ctx: &ApplyContext<'_>, staged: &mut Staged) -> Result<Step> {
        let manager = ctx.manager;
        let locks = manager.lock().apply_scope();
        let _volume_lock = locks
            .acquire_write(LockKind::Volume, &[self.volume.as_str()])
            .client_err()?;

        let volume_key = MetadataManager::volume_key(&self.volume);
        let existing = manager.volume_table().lookup(&volume_key).client_err()?;
        if is_replay_of(existing.version(), ctx.index) {
            debug!(
                "Replayed transaction {} ignored: delete volume {}",
                ctx.index, self.volume
            );
            return Ok(Step::Replay);
        }
        let Some(record) = existing.into_value() else {
            return Err(Error::VolumeNotFound(self.volume.clone()));
        };

        let _user_lock = locks
            .acquire_write(LockKind::User, &[record.owner.as_str()])
            .client_err()?;

        let buckets = manager
            .bucket_table()
            .keys_with_prefix(&MetadataManager::bucket_prefix(&self.volume))
            .client_err()?;
        if !buckets.is_empty() {
            return Err(Error::VolumeNotEmpty(self.volume.clone()));
        }

        let user_key = MetadataManager::user_key(&record.owner);
        match manager.user_table().get(&user_key).client_err()? {
            Some(mut owned) => {
                owned.volume_names.retain(|v| v != &self.volume);
                owned.update_id = ctx.index;
                let write = if owned.is_empty() {
                    manager.user_table().stage_delete(&user_key, ctx.index)
                } else {
                    manager.user_table().stage_put(&user_key, owned, ctx.index)
                };
                staged.push(write.client_err()?);
            }
            None => warn!(
                "Volume {} owner {} has no ownership list",
                self.volume, record.owner
            ),
        }

        staged.push(
            manager
                .volume_table()
                .stage_delete(&volume_key, ctx.index)
                .client_err()?,
        );
        staged.delta.volumes -= 1;

        Ok(Step::Done(Payload::Volume {
            volume: self.volume.clone(),
        }))
    }
}

impl RequestKind for DeleteVolumeRequest {
    const CMD: CommandType = CommandType::DeleteVolume;
    const AUDIT_ACTION: AuditAction = AuditAction::DeleteVolume;
    const LOCK_PLAN: &'static [LockStep] = &[
        (LockKind::Volume, LockMode::Write),
        (LockKind::User, LockMode::Write),
    ];

    fn pre_execute(mut self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        validate_name(&self.volume).map_err(|reason| Error::InvalidVolumeName {
            name: self.volume.clone(),
            reason,
        })?;
        self.caller = Some(ctx.caller.clone());
        Ok(self)
    }

    fn apply(&self, ctx: &ApplyContext<'_>) -> Applied {
        let mut staged = Staged::default();
        let result = self.apply_locked(ctx, &mut staged);
        Applied::finish(Self::CMD, result, staged)
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        params([("volume", self.volume.as_str())])
    }

    fn caller(&self) -> Option<&UserInfo> {
        self.caller.as_ref()
    }
}

/// Add `volume` to the owner's list, enforcing the per-owner limit.
///
/// Fails before anything is staged so a rejected create leaves no trace.
pub(crate) fn add_volume_to_owner(
    owned: Option<OwnerVolumes>,
    volume: &str,
    owner: &str,
    max: usize,
    index: u64,
) -> Result<OwnerVolumes> {
    let mut owned = owned.unwrap_or(OwnerVolumes {
        object_id: index,
        ..OwnerVolumes::default()
    });
    if owned.len() >= max {
        return Err(Error::UserTooManyVolumes {
            user: owner.to_string(),
            max,
        });
    }
    if !owned.contains(volume) {
        owned.volume_names.push(volume.to_string());
    }
    owned.update_id = index;
    Ok(owned)
}

/// Stage a new volume record together with its owner's updated list.
///
/// Caller holds the volume and user locks.
pub(crate) fn stage_new_volume(
    ctx: &ApplyContext<'_>,
    record: VolumeRecord,
    owned: OwnerVolumes,
    staged: &mut Staged,
) -> Result<()> {
    let manager = ctx.manager;
    let volume_key = MetadataManager::volume_key(&record.volume);
    let user_key = MetadataManager::user_key(&record.owner);
    staged.push(
        manager
            .volume_table()
            .stage_put(&volume_key, record, ctx.index)
            .client_err()?,
    );
    staged.push(
        manager
            .user_table()
            .stage_put(&user_key, owned, ctx.index)
            .client_err()?,
    );
    staged.delta.volumes += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_volume_to_owner() {
        let owned = add_volume_to_owner(None, "vol1", "alice", 2, 5).unwrap();
        assert_eq!(owned.volume_names, vec!["vol1".to_string()]);
        assert_eq!((owned.object_id, owned.update_id), (5, 5));

        let owned = add_volume_to_owner(Some(owned), "vol2", "alice", 2, 6).unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!((owned.object_id, owned.update_id), (5, 6));

        let err = add_volume_to_owner(Some(owned), "vol3", "alice", 2, 7).unwrap_err();
        assert_eq!(
            err,
            Error::UserTooManyVolumes {
                user: "alice".into(),
                max: 2
            }
        );
    }
}
