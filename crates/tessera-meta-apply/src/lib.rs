//! Tessera Metadata Apply
//!
//! Turns committed, totally-ordered log entries into metadata mutations,
//! exactly once even when the log re-delivers an entry.
//!
//! A request goes through two phases:
//!
//! 1. [`RequestPipeline::pre_execute`] on the proposing node, before the
//!    entry is written to the log. Validates the request shape and stamps
//!    server-generated fields so every replica commits the same entry.
//! 2. [`RequestPipeline::apply`] on every replica, in log order. Takes
//!    locks in the global order, checks for replay, stages the mutation in
//!    the table caches and registers it with the double buffer. Audit and
//!    metrics are emitted once the locks are released.
//!
//! The returned [`AppliedResponse`] carries a
//! [`tessera_meta_store::FlushFuture`] that resolves once the entry is
//! durable.

pub mod audit;
pub mod context;
pub mod metrics;
pub mod pipeline;
pub mod replay;
pub mod request;
pub mod response;

pub use audit::{AuditAction, AuditMessage, AuditSink, TracingAuditSink};
pub use metrics::{EntityDelta, MetaMetrics};
pub use pipeline::{AppliedResponse, PipelineError, RequestPipeline};
pub use replay::is_replay;
pub use request::{
    CreateBucketRequest, CreateS3BucketRequest, CreateVolumeRequest, DeleteBucketRequest,
    DeleteS3BucketRequest, DeleteVolumeRequest, LockStep, MetaRequest, RequestKind,
};
pub use response::{ClientResponse, CommandType, Payload, SideEffect, Status};
