//! # rowq
//!
//! Durable job queue on a single SQLite connection.
//!
//! Producers append typed jobs to a `jobs` table. Each job is dispatched to
//! the handler registered for its type tag either right after the insert
//! commits (commit hook) or by a background poll tick, and ends up
//! `completed` or `archived` with the error text that archived it.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod hook;
pub mod model;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
pub use hook::{CommitObserver, WriteOp};
pub use model::{Failure, Job, JobId, Outcome, State, Trigger};
pub use queue::{Database, Queue, QueueBuilder, QueueConfig};
pub use registry::{
    BoxError, Codec, CodecError, Handler, HandlerDescriptor, HandlerResult, JobContext, JsonCodec,
    Payload, validate_type_tag,
};
pub use scheduler::{BeatReport, SchedulerConfig};
