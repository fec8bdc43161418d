//! Core data model.
//!
//! A job is one row in the store: a type tag, an opaque payload, and a
//! lifecycle state that only ever moves forward.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work persisted in the `jobs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the store on insert. Insertion order is id order.
    pub id: JobId,

    /// Discriminator that selects the handler (and therefore the payload shape).
    #[serde(rename = "type")]
    pub job_type: String,

    /// Current lifecycle state.
    #[serde(rename = "status")]
    pub state: State,

    /// Codec output. The store never interprets these bytes.
    pub payload: Vec<u8>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Set only when the job ended in [`State::Archived`].
    pub error: Option<String>,
}

impl Job {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Newtype for job ids (SQLite rowids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Scheduled`, `Pending`, `Retry` and `WaitSignal` are reserved for retry
/// and workflow support. No transition leads into or out of them yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Just inserted.
    Enqueued,
    Scheduled,
    Pending,
    /// A poll dispatch has claimed the row and is running its handler.
    Active,
    Retry,
    WaitSignal,
    /// Handler succeeded. Terminal.
    Completed,
    /// Resolution, decoding or the handler failed. Terminal.
    Archived,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Enqueued,
        State::Scheduled,
        State::Pending,
        State::Active,
        State::Retry,
        State::WaitSignal,
        State::Completed,
        State::Archived,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Enqueued, Active)
                | (Enqueued, Completed)
                | (Enqueued, Archived)
                | (Active, Completed)
                | (Active, Archived)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Enqueued => "enqueued",
            State::Scheduled => "scheduled",
            State::Pending => "pending",
            State::Active => "active",
            State::Retry => "retry",
            State::WaitSignal => "wait_signal",
            State::Completed => "completed",
            State::Archived => "archived",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::UnknownState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Dispatch outcome
// ---------------------------------------------------------------------------

/// Which path handed a job to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Fired on the producer's connection right after its insert committed.
    CommitHook,
    /// Picked up by a poll tick.
    Poll,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::CommitHook => f.write_str("commit_hook"),
            Trigger::Poll => f.write_str("poll"),
        }
    }
}

/// Why a job was archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// No handler is registered for the job's type tag.
    Unresolved { job_type: String },
    /// The payload did not decode against the handler's shape.
    Decode { job_type: String, message: String },
    /// The handler returned an error.
    Handler(String),
    /// The handler panicked.
    Panicked(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Unresolved { job_type } => {
                write!(f, "no handler registered for type {job_type}")
            }
            Failure::Decode { job_type, message } => {
                write!(f, "failed to decode payload for type {job_type}: {message}")
            }
            Failure::Handler(message) => f.write_str(message),
            Failure::Panicked(message) => write!(f, "handler panicked: {message}"),
        }
    }
}

/// Terminal result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Archived(Failure),
}

impl Outcome {
    /// The terminal state this outcome is written as.
    pub fn state(&self) -> State {
        match self {
            Outcome::Completed => State::Completed,
            Outcome::Archived(_) => State::Archived,
        }
    }

    /// The message stored in the `error` column, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Outcome::Completed => None,
            Outcome::Archived(failure) => Some(failure.to_string()),
        }
    }
}
