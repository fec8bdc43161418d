//! Poll scheduler.
//!
//! One tokio task wakes on a fixed interval, fetches a bounded batch of
//! pending rows in id order and feeds them to the dispatcher. The batch runs
//! on the blocking pool since handlers are synchronous.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Error, Result};
use crate::guard::ConnectionGuard;
use crate::model::JobId;
use crate::telemetry::metrics;

/// Tick settings for the poll scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Upper bound on rows fetched per tick.
    pub batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            batch_limit: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be greater than zero".into()));
        }
        if self.batch_limit == 0 {
            return Err(Error::Config("batch limit must be greater than zero".into()));
        }
        Ok(())
    }
}

/// What one poll tick did.
#[derive(Debug, Default)]
pub struct BeatReport {
    /// Rows returned by the pending query.
    pub fetched: usize,
    /// Jobs whose handler ran, in the order they ran.
    pub dispatched: Vec<DispatchReport>,
    /// Rows left alone: claimed by the other path or already settled.
    pub skipped: usize,
    /// Rows whose state could not be read or written.
    pub failed: Vec<(JobId, Error)>,
}

/// Everything a tick needs, cheap to clone into the blocking pool.
#[derive(Clone)]
pub(crate) struct Poller {
    guard: ConnectionGuard,
    dispatcher: Arc<Dispatcher>,
    batch_limit: usize,
}

impl Poller {
    pub fn new(guard: ConnectionGuard, dispatcher: Arc<Dispatcher>, batch_limit: usize) -> Self {
        Self {
            guard,
            dispatcher,
            batch_limit,
        }
    }

    /// Run one tick, checking `keep_going` before each job.
    pub fn beat_while<F>(&self, mut keep_going: F) -> Result<BeatReport>
    where
        F: FnMut() -> bool,
    {
        let batch = self.guard.with(|storage| storage.list_pending(self.batch_limit))?;
        metrics::poll_batch_size().record(batch.len() as u64, &[]);

        let mut report = BeatReport {
            fetched: batch.len(),
            ..BeatReport::default()
        };

        for (done, job) in batch.iter().enumerate() {
            if !keep_going() {
                debug!(remaining = batch.len() - done, "tick interrupted");
                break;
            }
            match self.dispatcher.dispatch_guarded(&self.guard, job) {
                Ok(Some(dispatched)) => report.dispatched.push(dispatched),
                Ok(None) => report.skipped += 1,
                Err(Error::Closed) => {
                    warn!(job_id = %job.id, "queue closed mid-tick; job left for a later poll");
                    report.failed.push((job.id, Error::Closed));
                    break;
                }
                Err(e) => {
                    error!(job_id = %job.id, "dispatch failed: {e}");
                    report.failed.push((job.id, e));
                }
            }
        }

        Ok(report)
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }
}

/// Handle to a running poll task.
///
/// Dropping the handle also stops the task at its next tick boundary.
pub(crate) struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn spawn(runtime: &tokio::runtime::Handle, poller: Poller, config: SchedulerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = runtime.spawn(run(poller, config, shutdown_rx));
        Self { shutdown_tx, join }
    }

    /// Ask the task to stop. A tick already running finishes its current
    /// job first; nothing here waits for it.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.shutdown_tx.send(true);
        self.join
    }
}

async fn run(poller: Poller, config: SchedulerConfig, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = tokio::time::interval(config.tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        tick_ms = config.tick_interval.as_millis() as u64,
        batch_limit = config.batch_limit,
        "poll scheduler started"
    );

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticks.tick() => {}
        }

        let tick = poller.clone();
        let stop = shutdown.clone();
        let beat = tokio::task::spawn_blocking(move || tick.beat_while(|| !*stop.borrow()));

        match beat.await {
            Ok(Ok(report)) if report.fetched > 0 => {
                debug!(
                    fetched = report.fetched,
                    dispatched = report.dispatched.len(),
                    skipped = report.skipped,
                    failed = report.failed.len(),
                    "poll tick"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(Error::Closed)) => break,
            Ok(Err(e)) => error!("poll tick failed: {e}"),
            Err(e) => warn!("poll tick aborted: {e}"),
        }

        if poller.is_closed() {
            break;
        }
    }

    info!("poll scheduler stopped");
}
