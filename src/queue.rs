//! The queue facade.
//!
//! A [`Queue`] owns one store, one type registry and (optionally) one poll
//! scheduler. Handlers are registered on the [`QueueBuilder`] before the
//! queue opens; after that the registry is read-only.
//!
//! ```no_run
//! use rowq::{JobContext, Payload, Queue, QueueConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct PingMsg {
//!     msg: String,
//! }
//!
//! impl Payload for PingMsg {}
//!
//! # fn main() -> rowq::Result<()> {
//! let queue = Queue::builder(QueueConfig::default())
//!     .handle(|_: &JobContext, ping: PingMsg| {
//!         println!("{}", ping.msg);
//!         Ok(())
//!     })?
//!     .open()?;
//!
//! queue.send(&PingMsg { msg: "hello".into() })?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::guard::ConnectionGuard;
use crate::hook::{CommitObserver, JobsObserver};
use crate::model::{Job, JobId, State};
use crate::registry::{
    Codec, HandlerDescriptor, HandlerResult, JobContext, JsonCodec, Payload, TypeRegistry,
    validate_type_tag,
};
use crate::scheduler::{BeatReport, Poller, SchedulerConfig, SchedulerHandle};
use crate::storage::Storage;
use crate::telemetry::metrics;

/// Where the jobs table lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Database {
    /// Private in-memory database, gone when the queue closes.
    #[default]
    Memory,
    File(PathBuf),
}

impl std::fmt::Display for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Database::Memory => f.write_str(":memory:"),
            Database::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub database: Database,
    /// Dispatch freshly inserted jobs on the producer's connection right
    /// after commit. When off, only the poll scheduler runs jobs.
    pub commit_hook: bool,
    pub scheduler: SchedulerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database: Database::Memory,
            commit_hook: true,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: Database::File(path.into()),
            ..Self::default()
        }
    }

    pub fn commit_hook(mut self, enabled: bool) -> Self {
        self.commit_hook = enabled;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// Collects handlers and observers, then opens the store.
pub struct QueueBuilder {
    config: QueueConfig,
    registry: TypeRegistry,
    observers: Vec<Arc<dyn CommitObserver>>,
}

impl QueueBuilder {
    /// Handle payloads of type `T` stored under `type_tag`.
    pub fn register<T, F>(mut self, type_tag: impl Into<String>, handler: F) -> Result<Self>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&JobContext, T) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(type_tag, handler)?;
        Ok(self)
    }

    /// Handle payloads of type `T` under `T::type_tag()`.
    pub fn handle<T, F>(self, handler: F) -> Result<Self>
    where
        T: Payload,
        F: Fn(&JobContext, T) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(HandlerDescriptor::from_fn(handler))
    }

    /// Add a prepared descriptor (custom codec, struct handler, ...).
    pub fn on(mut self, descriptor: HandlerDescriptor) -> Result<Self> {
        self.registry.on(descriptor)?;
        Ok(self)
    }

    /// Extra observer for committed row writes, in addition to the jobs
    /// observer installed when the commit hook is enabled.
    pub fn observe(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn open(self) -> Result<Queue> {
        self.config.scheduler.validate()?;

        let mut storage = match &self.config.database {
            Database::Memory => Storage::in_memory()?,
            Database::File(path) => Storage::open(path)?,
        };

        let handlers = self.registry.len();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(self.registry)));

        if self.config.commit_hook {
            storage.add_observer(Arc::new(JobsObserver::new(Arc::clone(&dispatcher))));
        }
        for observer in self.observers {
            storage.add_observer(observer);
        }

        let guard = ConnectionGuard::new(storage);
        let poller = Poller::new(
            guard.clone(),
            Arc::clone(&dispatcher),
            self.config.scheduler.batch_limit,
        );

        info!(
            database = %self.config.database,
            commit_hook = self.config.commit_hook,
            handlers,
            "queue opened"
        );

        Ok(Queue {
            inner: Arc::new(Inner {
                guard,
                dispatcher,
                poller,
                config: self.config,
                scheduler: Mutex::new(None),
            }),
        })
    }
}

/// A durable job queue. Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    guard: ConnectionGuard,
    dispatcher: Arc<Dispatcher>,
    poller: Poller,
    config: QueueConfig,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl Queue {
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder {
            config,
            registry: TypeRegistry::new(),
            observers: Vec::new(),
        }
    }

    /// Open a queue with no handlers, e.g. for a producer-only process.
    pub fn open(config: QueueConfig) -> Result<Self> {
        Self::builder(config).open()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.dispatcher.registry().registered_types()
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Enqueue `value` under its derived type tag.
    ///
    /// With the commit hook enabled the job has already been dispatched when
    /// this returns.
    pub fn send<T: Payload>(&self, value: &T) -> Result<JobId> {
        self.send_tagged(T::type_tag(), value)
    }

    /// Enqueue `value` as JSON under an explicit tag.
    pub fn send_tagged<T>(&self, type_tag: &str, value: &T) -> Result<JobId>
    where
        T: Serialize + DeserializeOwned,
    {
        self.send_with(type_tag, &JsonCodec, value)
    }

    /// Enqueue an untyped JSON document.
    pub fn send_json(&self, type_tag: &str, value: &serde_json::Value) -> Result<JobId> {
        self.send_tagged(type_tag, value)
    }

    /// Enqueue `value` encoded with `codec`.
    pub fn send_with<T, C>(&self, type_tag: &str, codec: &C, value: &T) -> Result<JobId>
    where
        C: Codec<T>,
    {
        validate_type_tag(type_tag)?;

        let payload = codec.encode(value).map_err(|source| Error::Serialization {
            type_tag: type_tag.to_string(),
            source,
        })?;

        let id = self
            .inner
            .guard
            .with(|storage| storage.insert_job(type_tag, &payload))?;

        metrics::jobs_sent().add(1, &[KeyValue::new("job_type", type_tag.to_string())]);
        debug!(job_id = %id, job_type = type_tag, "job enqueued");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.inner.guard.with(|storage| storage.get_job(id))
    }

    /// Up to `limit` jobs in `state`, oldest first.
    pub fn get_by_state(&self, state: State, limit: usize) -> Result<Vec<Job>> {
        self.inner
            .guard
            .with(|storage| storage.list_by_state(state, limit))
    }

    /// Every job, in id order.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        self.inner.guard.with(|storage| storage.list_all())
    }

    pub fn counts(&self) -> Result<BTreeMap<State, u64>> {
        self.inner.guard.with(|storage| storage.count_by_state())
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Run one poll tick on the calling thread.
    pub fn beat(&self) -> Result<BeatReport> {
        self.inner.poller.beat_while(|| true)
    }

    /// Start the background poll task on the current tokio runtime.
    pub fn start_scheduler(&self) -> Result<()> {
        let mut slot = self.scheduler_slot();
        if slot.is_some() {
            return Err(Error::Other("poll scheduler is already running".into()));
        }
        if self.inner.guard.is_closed() {
            return Err(Error::Closed);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("poll scheduler needs a tokio runtime: {e}")))?;

        *slot = Some(SchedulerHandle::spawn(
            &runtime,
            self.inner.poller.clone(),
            self.inner.config.scheduler.clone(),
        ));
        Ok(())
    }

    /// Signal the poll task to stop.
    ///
    /// Returns the task handle the first time, `None` if no scheduler was
    /// running. Awaiting the handle is optional.
    pub fn stop_scheduler(&self) -> Option<JoinHandle<()>> {
        self.scheduler_slot().take().map(SchedulerHandle::stop)
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler_slot().is_some()
    }

    /// Stop the scheduler, then release the connection.
    ///
    /// Handlers still running are not waited for; their outcome writes fail
    /// with [`Error::Closed`] and are logged.
    pub fn close(&self) -> Result<()> {
        if self.stop_scheduler().is_some() {
            debug!("poll scheduler signalled");
        }
        if self.inner.guard.is_closed() {
            return Ok(());
        }
        self.inner.guard.close()?;
        info!(database = %self.inner.config.database, "queue closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.guard.is_closed()
    }

    fn scheduler_slot(&self) -> MutexGuard<'_, Option<SchedulerHandle>> {
        self.inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
