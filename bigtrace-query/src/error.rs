//! Named error taxonomy surfaced by the trace-processor wrapper, worker,
//! and orchestrator. `Cancelled` is deliberately absent — cancellation
//! surfaces as stream termination, never as an error value.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request is already in flight")]
    InFlight,

    #[error("load failed: {0}")]
    LoadFailure(String),

    #[error("query failed: {0}")]
    QueryFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
