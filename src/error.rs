//! Error types for rowq.
//!
//! Only setup-time and producer-time failures surface as [`Error`]. Job-level
//! failures (unresolved type, decode, handler) are recorded on the row instead.

use thiserror::Error;

use crate::model::{JobId, State};
use crate::registry::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("handler already registered for type {0}")]
    DuplicateType(String),

    #[error("invalid type tag: {0:?}")]
    InvalidTypeTag(String),

    #[error("failed to encode payload for type {type_tag}: {source}")]
    Serialization {
        type_tag: String,
        #[source]
        source: CodecError,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("unknown job state: {0}")]
    UnknownState(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("queue is closed")]
    Closed,

    #[error("queue connection is already held by this thread; a commit-hook handler cannot call back into its own queue")]
    Reentrant,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
