//! Audit trail for applied requests.
//!
//! Messages are emitted by the pipeline after every lock taken for the
//! request has been released. Sinks must not block.

use derive_more::Display;
use std::collections::BTreeMap;
use tessera_common::UserInfo;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum AuditAction {
    #[display("CREATE_VOLUME")]
    CreateVolume,
    #[display("DELETE_VOLUME")]
    DeleteVolume,
    #[display("CREATE_BUCKET")]
    CreateBucket,
    #[display("DELETE_BUCKET")]
    DeleteBucket,
    #[display("CREATE_S3_BUCKET")]
    CreateS3Bucket,
    #[display("DELETE_S3_BUCKET")]
    DeleteS3Bucket,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditMessage {
    pub action: AuditAction,
    pub params: BTreeMap<String, String>,
    /// Error message for failed requests
    pub error: Option<String>,
    pub user: Option<UserInfo>,
}

impl AuditMessage {
    pub fn new(action: AuditAction, params: BTreeMap<String, String>) -> Self {
        Self {
            action,
            params,
            error: None,
            user: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<UserInfo>) -> Self {
        self.user = user;
        self
    }

    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn params_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Receiver of audit messages
pub trait AuditSink: Send + Sync {
    fn log(&self, message: AuditMessage);
}

/// Writes audit messages as tracing events with target `audit`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, message: AuditMessage) {
        let user = message.user.as_ref().map_or("-", |u| u.user_name.as_str());
        let ip = message
            .user
            .as_ref()
            .and_then(|u| u.remote_address.as_deref())
            .unwrap_or("-");
        let params = message.params_string();
        match &message.error {
            None => info!(
                target: "audit",
                user, ip, op = %message.action, ret = "SUCCESS",
                "{params}"
            ),
            Some(error) => warn!(
                target: "audit",
                user, ip, op = %message.action, ret = "FAILURE",
                "{params}: {error}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        let mut params = BTreeMap::new();
        params.insert("volume".to_string(), "s3alice".to_string());
        params.insert("bucket".to_string(), "logs".to_string());

        let msg = AuditMessage::new(AuditAction::CreateBucket, params)
            .with_user(Some(UserInfo::new("alice").with_remote_address("10.0.0.1")));
        assert!(msg.is_success());
        assert_eq!(msg.params_string(), "bucket=logs, volume=s3alice");
        assert_eq!(msg.action.to_string(), "CREATE_BUCKET");

        let failed = msg.with_error(Some("bucket already exists".into()));
        assert!(!failed.is_success());
        TracingAuditSink.log(failed);
    }
}
