//! Execution contexts for the two request phases.

use crate::metrics::EntityDelta;
use crate::response::{ClientResponse, CommandType, Payload, SideEffect};
use tessera_common::config::LimitsConfig;
use tessera_common::{Clock, Error, UserInfo};
use tessera_meta_store::{LockError, MetaStoreError, MetadataManager, StagedWrite};

/// Inputs available to `pre_execute`: no table access
pub struct PreExecuteContext<'a> {
    pub clock: &'a dyn Clock,
    pub limits: &'a LimitsConfig,
    pub caller: &'a UserInfo,
}

/// Inputs available to `apply` for the entry committed at `index`
pub struct ApplyContext<'a> {
    pub manager: &'a MetadataManager,
    pub limits: &'a LimitsConfig,
    pub index: u64,
}

/// Mutations staged so far by one apply.
///
/// Nothing staged is rolled back when a later step fails: the response
/// keeps the writes so the flush engine persists exactly what the cache
/// holds.
#[derive(Debug, Default)]
pub struct Staged {
    pub writes: Vec<StagedWrite>,
    pub side_effects: Vec<SideEffect>,
    pub delta: EntityDelta,
}

impl Staged {
    pub fn push(&mut self, write: StagedWrite) {
        self.writes.push(write);
    }
}

/// Successful end of an apply
#[derive(Debug)]
pub enum Step {
    Done(Payload),
    /// The tables already reflect this entry
    Replay,
}

/// What the pipeline needs after a request kind has applied
#[derive(Debug)]
pub struct Applied {
    pub response: ClientResponse,
    /// Entity count change of everything staged, failed responses included
    pub delta: EntityDelta,
    pub replay: bool,
    pub error: Option<Error>,
}

impl Applied {
    /// Assemble the response from the apply result and what was staged
    pub fn finish(cmd: CommandType, result: Result<Step, Error>, staged: Staged) -> Self {
        match result {
            Ok(Step::Replay) => Self {
                response: ClientResponse::replay(cmd),
                delta: EntityDelta::default(),
                replay: true,
                error: None,
            },
            Ok(Step::Done(payload)) => {
                let mut response = ClientResponse::success(cmd, payload);
                response.side_effects = staged.side_effects;
                response.writes = staged.writes;
                Self {
                    response,
                    delta: staged.delta,
                    replay: false,
                    error: None,
                }
            }
            Err(error) => {
                let mut response = ClientResponse::error(cmd, &error);
                response.writes = staged.writes;
                Self {
                    response,
                    delta: staged.delta,
                    replay: false,
                    error: Some(error),
                }
            }
        }
    }
}

/// Conversion of store and lock failures into client errors
pub trait ClientResultExt<T> {
    fn client_err(self) -> Result<T, Error>;
}

impl<T> ClientResultExt<T> for Result<T, MetaStoreError> {
    fn client_err(self) -> Result<T, Error> {
        self.map_err(|e| Error::internal(e.to_string()))
    }
}

impl<T> ClientResultExt<T> for Result<T, LockError> {
    fn client_err(self) -> Result<T, Error> {
        self.map_err(|e| match e {
            LockError::Timeout { kind, key } => Error::LockTimeout(format!("{kind} on '{key}'")),
            e @ LockError::OrderViolation { .. } => Error::internal(e.to_string()),
        })
    }
}
