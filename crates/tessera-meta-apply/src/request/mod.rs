//! Request kinds and their two-phase contract.
//!
//! Each kind implements [`RequestKind`]: `pre_execute` normalizes the
//! request before it is proposed to the log (no table access), `apply`
//! runs on every replica in log order. [`MetaRequest`] is the closed set
//! of kinds the log carries.
//!
//! Lock plans list the resource kinds a request may take, in acquisition
//! order. Acquisition goes through a [`tessera_meta_store::LockScope`],
//! which rejects any step that would break the global rank order.

mod bucket;
mod s3_bucket;
mod volume;

pub use bucket::{CreateBucketRequest, DeleteBucketRequest};
pub use s3_bucket::{CreateS3BucketRequest, DeleteS3BucketRequest, S3_ADMIN_NAME};
pub use volume::{CreateVolumeRequest, DeleteVolumeRequest};

use crate::audit::AuditAction;
use crate::context::{Applied, ApplyContext, PreExecuteContext};
use crate::response::CommandType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_common::{Result, UserInfo};
use tessera_meta_store::{Acl, LockKind, LockMode};

/// One step of a lock plan
pub type LockStep = (LockKind, LockMode);

/// Two-phase capability shared by every request kind
pub trait RequestKind: Sized {
    const CMD: CommandType;
    const AUDIT_ACTION: AuditAction;
    /// Resource kinds taken while applying, in acquisition order
    const LOCK_PLAN: &'static [LockStep];

    /// Validate the request shape and stamp server-generated fields.
    fn pre_execute(self, ctx: &PreExecuteContext<'_>) -> Result<Self>;

    /// Validate against current state and stage the mutation.
    fn apply(&self, ctx: &ApplyContext<'_>) -> Applied;

    fn audit_params(&self) -> BTreeMap<String, String>;

    fn caller(&self) -> Option<&UserInfo>;
}

/// A request as carried by the replicated log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MetaRequest {
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    CreateBucket(CreateBucketRequest),
    DeleteBucket(DeleteBucketRequest),
    CreateS3Bucket(CreateS3BucketRequest),
    DeleteS3Bucket(DeleteS3BucketRequest),
}

macro_rules! dispatch {
    ($self:expr, $req:ident => $body:expr) => {
        match $self {
            MetaRequest::CreateVolume($req) => $body,
            MetaRequest::DeleteVolume($req) => $body,
            MetaRequest::CreateBucket($req) => $body,
            MetaRequest::DeleteBucket($req) => $body,
            MetaRequest::CreateS3Bucket($req) => $body,
            MetaRequest::DeleteS3Bucket($req) => $body,
        }
    };
}

const fn plan_of<R: RequestKind>(_: &R) -> &'static [LockStep] {
    R::LOCK_PLAN
}

const fn cmd_of<R: RequestKind>(_: &R) -> CommandType {
    R::CMD
}

const fn action_of<R: RequestKind>(_: &R) -> AuditAction {
    R::AUDIT_ACTION
}

impl MetaRequest {
    pub const fn cmd(&self) -> CommandType {
        dispatch!(self, r => cmd_of(r))
    }

    pub const fn audit_action(&self) -> AuditAction {
        dispatch!(self, r => action_of(r))
    }

    pub const fn lock_plan(&self) -> &'static [LockStep] {
        dispatch!(self, r => plan_of(r))
    }

    pub fn pre_execute(self, ctx: &PreExecuteContext<'_>) -> Result<Self> {
        Ok(match self {
            Self::CreateVolume(r) => Self::CreateVolume(r.pre_execute(ctx)?),
            Self::DeleteVolume(r) => Self::DeleteVolume(r.pre_execute(ctx)?),
            Self::CreateBucket(r) => Self::CreateBucket(r.pre_execute(ctx)?),
            Self::DeleteBucket(r) => Self::DeleteBucket(r.pre_execute(ctx)?),
            Self::CreateS3Bucket(r) => Self::CreateS3Bucket(r.pre_execute(ctx)?),
            Self::DeleteS3Bucket(r) => Self::DeleteS3Bucket(r.pre_execute(ctx)?),
        })
    }

    pub fn apply(&self, ctx: &ApplyContext<'_>) -> Applied {
        dispatch!(self, r => r.apply(ctx))
    }

    pub fn audit_params(&self) -> BTreeMap<String, String> {
        dispatch!(self, r => r.audit_params())
    }

    pub fn caller(&self) -> Option<&UserInfo> {
        dispatch!(self, r => r.caller())
    }
}

/// ACLs attached to a newly created volume or bucket
pub(crate) fn default_acls(owner: &str, admin: Option<&str>) -> Vec<Acl> {
    let mut acls = vec![Acl::user_all(owner)];
    if let Some(admin) = admin.filter(|a| *a != owner) {
        acls.push(Acl::user_all(admin));
    }
    acls
}

pub(crate) fn params<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_plans() -> Vec<(CommandType, &'static [LockStep])> {
        vec![
            (CreateVolumeRequest::CMD, CreateVolumeRequest::LOCK_PLAN),
            (DeleteVolumeRequest::CMD, DeleteVolumeRequest::LOCK_PLAN),
            (CreateBucketRequest::CMD, CreateBucketRequest::LOCK_PLAN),
            (DeleteBucketRequest::CMD, DeleteBucketRequest::LOCK_PLAN),
            (CreateS3BucketRequest::CMD, CreateS3BucketRequest::LOCK_PLAN),
            (DeleteS3BucketRequest::CMD, DeleteS3BucketRequest::LOCK_PLAN),
        ]
    }

    #[test]
    fn test_lock_plans_follow_global_order() {
        for (cmd, plan) in all_plans() {
            assert!(!plan.is_empty(), "{cmd} has an empty lock plan");
            for pair in plan.windows(2) {
                assert!(
                    pair[0].0.rank() < pair[1].0.rank(),
                    "{cmd} acquires {} before {}",
                    pair[0].0,
                    pair[1].0
                );
            }
        }
    }

    #[test]
    fn test_no_two_kinds_conflict() {
        // Any two plans agree on the relative order of shared kinds
        let plans = all_plans();
        for (a_cmd, a) in &plans {
            for (b_cmd, b) in &plans {
                for (i, (x, _)) in a.iter().enumerate() {
                    for (y, _) in &a[i + 1..] {
                        let bx = b.iter().position(|(k, _)| k == x);
                        let by = b.iter().position(|(k, _)| k == y);
                        if let (Some(bx), Some(by)) = (bx, by) {
                            assert!(bx < by, "{a_cmd} and {b_cmd} order {x} and {y} differently");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_request_json_roundtrip_tag() {
        let json = r#"{"type":"CreateS3Bucket","user":"alice","s3_bucket":"logs"}"#;
        let req: MetaRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.cmd(), CommandType::CreateS3Bucket);
        assert_eq!(req.lock_plan()[0].0, LockKind::S3Bucket);
        match &req {
            MetaRequest::CreateS3Bucket(r) => {
                assert_eq!(r.user, "alice");
                assert_eq!(r.creation_time, 0);
                assert!(r.caller.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_default_acls() {
        assert_eq!(default_acls("alice", None).len(), 1);
        assert_eq!(default_acls("alice", Some("alice")).len(), 1);
        let acls = default_acls("alice", Some("root"));
        assert_eq!(acls[1].to_string(), "user:root:a");
    }
}
