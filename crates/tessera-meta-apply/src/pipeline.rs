//! The request pipeline: pre-execute before proposal, apply after commit.

use crate::audit::{AuditMessage, AuditSink, TracingAuditSink};
use crate::context::{ApplyContext, PreExecuteContext};
use crate::metrics::MetaMetrics;
use crate::request::MetaRequest;
use crate::response::ClientResponse;
use std::sync::Arc;
use std::time::Instant;
use tessera_common::config::LimitsConfig;
use tessera_common::{Clock, MetaConfig, Result, SystemClock, UserInfo};
use tessera_meta_store::{DoubleBuffer, FlushFuture, MetaStoreResult, MetadataManager};
use tracing::{debug, error, warn};

/// Failures that are not converted into a client response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("flush engine halted, refusing to apply entry {index}")]
    Halted { index: u64 },
}

/// Response of an applied entry together with its durability signal
#[derive(Debug)]
pub struct AppliedResponse {
    pub response: ClientResponse,
    pub flush: FlushFuture,
}

/// Applies committed log entries to the metadata tables
pub struct RequestPipeline {
    manager: Arc<MetadataManager>,
    buffer: Arc<DoubleBuffer>,
    limits: LimitsConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetaMetrics>,
}

impl RequestPipeline {
    pub fn new(
        manager: Arc<MetadataManager>,
        buffer: Arc<DoubleBuffer>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            manager,
            buffer,
            limits,
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
            metrics: Arc::new(MetaMetrics::new()),
        }
    }

    /// Open the store named by `config` and wire a pipeline over it.
    ///
    /// The flush loop is not started; call [`DoubleBuffer::start`] on
    /// [`RequestPipeline::buffer`].
    pub fn open(config: &MetaConfig) -> MetaStoreResult<Self> {
        let manager = Arc::new(MetadataManager::open(
            &config.store.db_path,
            config.lock.acquire_timeout(),
        )?);
        let buffer = Arc::new(DoubleBuffer::new(
            Arc::clone(&manager),
            config.flush.clone(),
        )?);
        Ok(Self::new(manager, buffer, config.limits.clone()))
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetaMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub const fn manager(&self) -> &Arc<MetadataManager> {
        &self.manager
    }

    pub const fn buffer(&self) -> &Arc<DoubleBuffer> {
        &self.buffer
    }

    pub const fn metrics(&self) -> &Arc<MetaMetrics> {
        &self.metrics
    }

    /// Normalize a client request before it is proposed to the log.
    ///
    /// Never touches the tables; failures never reach the log.
    pub fn pre_execute(&self, request: MetaRequest, caller: &UserInfo) -> Result<MetaRequest> {
        let cmd = request.cmd();
        let ctx = PreExecuteContext {
            clock: self.clock.as_ref(),
            limits: &self.limits,
            caller,
        };
        request
            .pre_execute(&ctx)
            .inspect_err(|e| debug!("{cmd} rejected before proposal: {e}"))
    }

    /// Apply the entry committed at `index`.
    ///
    /// Validation and conflict failures come back as unsuccessful
    /// responses. Only a halted flush engine is an error.
    pub fn apply(
        &self,
        request: &MetaRequest,
        index: u64,
    ) -> std::result::Result<AppliedResponse, PipelineError> {
        if self.buffer.is_halted() {
            error!("Refusing to apply entry {index}: flush engine halted");
            return Err(PipelineError::Halted { index });
        }

        let cmd = request.cmd();
        let start = Instant::now();
        let slot = self.buffer.reserve(index);
        let ctx = ApplyContext {
            manager: &self.manager,
            limits: &self.limits,
            index,
        };
        let applied = request.apply(&ctx);
        let flush = slot.complete(applied.response.writes.clone());
        let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);

        // Every lock taken for the request is released at this point
        if applied.replay {
            self.metrics.record_replay(cmd);
        } else {
            let message = AuditMessage::new(request.audit_action(), request.audit_params())
                .with_error(applied.error.as_ref().map(ToString::to_string))
                .with_user(request.caller().cloned());
            self.audit.log(message);
            // Writes staged before a failure are persisted too
            self.metrics.apply_entity_delta(applied.delta);

            match &applied.error {
                None => debug!("{cmd} applied at index {index}"),
                Some(e) if e.is_invariant_violation() => {
                    self.metrics.record_invariant_violation();
                }
                Some(e) => warn!("{cmd} at index {index} failed: {e}"),
            }
        }
        self.metrics
            .record_apply(cmd, applied.response.is_ok(), latency_us);

        Ok(AppliedResponse {
            response: applied.response,
            flush,
        })
    }

    /// Prometheus text for the pipeline and flush engine
    pub fn export_metrics(&self) -> String {
        self.metrics.export_prometheus(&self.buffer.stats())
    }
}
