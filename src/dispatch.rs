//! Dispatcher: resolve, decode, invoke, record.
//!
//! Both trigger paths end up here. The commit-hook path hands over the
//! connection it is already holding; the poll path goes through the
//! [`ConnectionGuard`] and lets go of it while the handler runs.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use opentelemetry::KeyValue;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;
use crate::guard::ConnectionGuard;
use crate::model::{Failure, Job, JobId, Outcome, State, Trigger};
use crate::registry::{JobContext, TypeRegistry};
use crate::storage::{self, Transition};
use crate::telemetry::job::{record_state_transition, start_dispatch_span};
use crate::telemetry::metrics;

/// Result of one dispatch attempt that reached the handler stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub id: JobId,
    pub trigger: Trigger,
    pub outcome: Outcome,
    /// Whether the outcome was written, or the row had already moved on.
    pub transition: Transition,
}

pub struct Dispatcher {
    registry: Arc<TypeRegistry>,
    /// Job ids currently being dispatched by either path.
    in_flight: Mutex<HashSet<JobId>>,
}

/// Releases an in-flight claim on drop.
struct Claim<'a> {
    dispatcher: &'a Dispatcher,
    id: JobId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.dispatcher.in_flight().remove(&self.id);
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, id: JobId) -> Option<Claim<'_>> {
        self.in_flight().insert(id).then(|| Claim {
            dispatcher: self,
            id,
        })
    }

    /// Is `id` being dispatched right now?
    pub fn is_in_flight(&self, id: JobId) -> bool {
        self.in_flight().contains(&id)
    }

    /// Resolve the handler, decode the payload and run it.
    ///
    /// Never fails and never unwinds: every problem becomes an archived
    /// outcome. Touches no storage.
    pub fn execute(&self, job: &Job, trigger: Trigger) -> Outcome {
        let Some(descriptor) = self.registry.resolve(&job.job_type) else {
            metrics::jobs_unroutable().add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
            return Outcome::Archived(Failure::Unresolved {
                job_type: job.job_type.clone(),
            });
        };

        let ctx = JobContext {
            id: job.id,
            job_type: job.job_type.clone(),
            trigger,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| descriptor.invoke(&ctx, &job.payload))) {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(failure)) => Outcome::Archived(failure),
            Err(panic) => Outcome::Archived(Failure::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Dispatch one job entirely on `conn`, which the caller already owns.
    ///
    /// Returns `None` when the job is already being dispatched, or is no
    /// longer pending.
    pub fn dispatch_on(
        &self,
        conn: &Connection,
        id: JobId,
        trigger: Trigger,
    ) -> Result<Option<DispatchReport>> {
        let Some(_claim) = self.claim(id) else {
            return Ok(None);
        };

        let job = storage::get_job_on(conn, id)?;
        if !matches!(job.state, State::Enqueued | State::Active) {
            return Ok(None);
        }

        self.settle(&job, trigger, |outcome| storage::finish_on(conn, id, outcome))
            .map(Some)
    }

    /// Dispatch one job from a poll batch.
    ///
    /// The guard is held to mark the row `Active` and again to record the
    /// outcome, but not while the handler runs.
    pub fn dispatch_guarded(
        &self,
        guard: &ConnectionGuard,
        job: &Job,
    ) -> Result<Option<DispatchReport>> {
        let Some(_claim) = self.claim(job.id) else {
            return Ok(None);
        };

        let Some(job) = guard.with(|storage| storage.activate(job.id))? else {
            return Ok(None);
        };

        self.settle(&job, Trigger::Poll, |outcome| {
            guard.with(|storage| storage.finish(job.id, outcome))
        })
        .map(Some)
    }

    /// Execute `job` and hand the outcome to `record` for the state write.
    fn settle<F>(&self, job: &Job, trigger: Trigger, record: F) -> Result<DispatchReport>
    where
        F: FnOnce(&Outcome) -> Result<Transition>,
    {
        let span = start_dispatch_span(&job.job_type, job.id, trigger);
        let _entered = span.enter();

        let started = Instant::now();
        let outcome = self.execute(job, trigger);
        metrics::dispatch_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("job_type", job.job_type.clone()),
                KeyValue::new("trigger", trigger.to_string()),
            ],
        );

        let transition = record(&outcome)?;
        match transition {
            Transition::Applied { from, to } => {
                record_state_transition(&span, from.as_str(), to.as_str());
                metrics::job_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", from.as_str()),
                        KeyValue::new("to", to.as_str()),
                    ],
                );
                match &outcome {
                    Outcome::Completed => debug!("job completed"),
                    Outcome::Archived(failure) => warn!(error = %failure, "job archived"),
                }
            }
            Transition::Skipped { current } => {
                debug!(%current, "job already settled, outcome dropped");
            }
        }

        Ok(DispatchReport {
            id: job.id,
            trigger,
            outcome,
            transition,
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct PingMsg {
        msg: String,
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = TypeRegistry::new();
        registry
            .register::<PingMsg, _>("PingMsg", |_: &JobContext, ping: PingMsg| {
                match ping.msg.as_str() {
                    "boom" => Err("boom".into()),
                    "panic" => panic!("handler blew up"),
                    _ => Ok(()),
                }
            })
            .unwrap();
        Dispatcher::new(Arc::new(registry))
    }

    fn job(job_type: &str, payload: &str) -> Job {
        Job {
            id: JobId(1),
            job_type: job_type.to_string(),
            state: State::Enqueued,
            payload: payload.as_bytes().to_vec(),
            created_at: chrono::Utc::now(),
            updated_at: None,
            error: None,
        }
    }

    #[test]
    fn execute_maps_every_failure_to_an_archived_outcome() {
        let d = dispatcher();

        assert_eq!(
            d.execute(&job("PingMsg", r#"{"msg":"hi"}"#), Trigger::Poll),
            Outcome::Completed
        );
        assert_eq!(
            d.execute(&job("PingMsg", r#"{"msg":"boom"}"#), Trigger::Poll),
            Outcome::Archived(Failure::Handler("boom".into()))
        );
        assert_eq!(
            d.execute(&job("Nope", "{}"), Trigger::Poll),
            Outcome::Archived(Failure::Unresolved {
                job_type: "Nope".into()
            })
        );
        assert!(matches!(
            d.execute(&job("PingMsg", "not json"), Trigger::Poll),
            Outcome::Archived(Failure::Decode { .. })
        ));
        assert_eq!(
            d.execute(&job("PingMsg", r#"{"msg":"panic"}"#), Trigger::Poll),
            Outcome::Archived(Failure::Panicked("handler blew up".into()))
        );
    }

    #[test]
    fn dispatch_on_writes_once_and_ignores_redelivery() {
        let d = dispatcher();
        let mut storage = Storage::in_memory().unwrap();
        let id = storage.insert_job("PingMsg", br#"{"msg":"hi"}"#).unwrap();

        let report = d
            .dispatch_on(storage.conn(), id, Trigger::CommitHook)
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(
            report.transition,
            Transition::Applied {
                from: State::Enqueued,
                to: State::Completed
            }
        );

        assert!(d.dispatch_on(storage.conn(), id, Trigger::Poll).unwrap().is_none());
        assert!(!d.is_in_flight(id));
    }

    #[test]
    fn claimed_job_is_not_dispatched_twice() {
        let d = dispatcher();
        let mut storage = Storage::in_memory().unwrap();
        let id = storage.insert_job("PingMsg", br#"{"msg":"hi"}"#).unwrap();

        let claim = d.claim(id).unwrap();
        assert!(d.is_in_flight(id));
        assert!(d.dispatch_on(storage.conn(), id, Trigger::Poll).unwrap().is_none());
        assert_eq!(storage.get_job(id).unwrap().state, State::Enqueued);

        drop(claim);
        assert!(d.dispatch_on(storage.conn(), id, Trigger::Poll).unwrap().is_some());
    }

    #[test]
    fn guarded_dispatch_marks_active_then_settles() {
        let d = dispatcher();
        let mut storage = Storage::in_memory().unwrap();
        let id = storage.insert_job("PingMsg", br#"{"msg":"boom"}"#).unwrap();
        let guard = ConnectionGuard::new(storage);

        let job = guard.with(|s| s.get_job(id)).unwrap();
        let report = d.dispatch_guarded(&guard, &job).unwrap().unwrap();
        assert_eq!(
            report.transition,
            Transition::Applied {
                from: State::Active,
                to: State::Archived
            }
        );

        let stored = guard.with(|s| s.get_job(id)).unwrap();
        assert_eq!(stored.state, State::Archived);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }
}
