//! Dispatch span helpers.

use tracing::Span;

use crate::model::{JobId, Trigger};

/// Start a span covering one dispatch attempt.
///
/// `job.state` is declared empty and filled in by
/// [`record_state_transition`] once the outcome is written.
pub fn start_dispatch_span(job_type: &str, id: JobId, trigger: Trigger) -> Span {
    tracing::info_span!(
        "job.dispatch",
        "job.type" = job_type,
        "job.id" = id.0,
        "job.trigger" = %trigger,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and emit an event inside it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
