//! Metric instruments for rowq.
//!
//! Uses the globally registered `MeterProvider`; without one the instruments
//! are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("rowq")
}

/// Counter: jobs accepted by `send`.
/// Labels: `job_type`.
pub fn jobs_sent() -> Counter<u64> {
    meter()
        .u64_counter("rowq.jobs.sent")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions written by the dispatcher.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("rowq.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs archived because no handler is registered for their type.
/// Labels: `job_type`.
pub fn jobs_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("rowq.jobs.unroutable")
        .with_description("Jobs with no registered handler")
        .build()
}

/// Histogram: time spent resolving, decoding and running a handler.
/// Labels: `job_type`, `trigger`.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rowq.dispatch.duration_ms")
        .with_description("Dispatch duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: rows fetched per poll tick.
pub fn poll_batch_size() -> Histogram<u64> {
    meter()
        .u64_histogram("rowq.poll.batch_size")
        .with_description("Jobs fetched per poll tick")
        .build()
}
