//! Tessera Common - Shared types and utilities
//!
//! This crate provides the client-facing error taxonomy, configuration
//! structures, name validation and the clock abstraction used by the
//! metadata store and the request pipeline.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MetaConfig;
pub use error::{Error, ErrorKind, Result, ResultCode};
pub use types::*;
