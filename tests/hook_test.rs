//! Integration tests for dispatch straight from the commit hook.

use std::sync::{Arc, Mutex, OnceLock};

use rowq::{
    CommitObserver, HandlerResult, JobContext, Payload, Queue, QueueConfig, State, Trigger,
    WriteOp,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct PingMsg {
    msg: String,
}

impl Payload for PingMsg {}

fn ping(msg: &str) -> PingMsg {
    PingMsg {
        msg: msg.to_string(),
    }
}

#[test]
fn insert_is_dispatched_before_send_returns() {
    let triggers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&triggers);
    let queue = Queue::builder(QueueConfig::default())
        .handle(move |ctx: &JobContext, _: PingMsg| {
            sink.lock().unwrap().push(ctx.trigger);
            Ok(())
        })
        .unwrap()
        .open()
        .unwrap();

    let id = queue.send(&ping("hello")).unwrap();

    let job = queue.get(id).unwrap();
    assert_eq!(job.state, State::Completed);
    assert!(job.updated_at.is_some());
    assert_eq!(*triggers.lock().unwrap(), [Trigger::CommitHook]);

    // Nothing left for the poll path.
    let report = queue.beat().unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(triggers.lock().unwrap().len(), 1);
}

#[test]
fn unresolved_type_is_archived_immediately() {
    let queue = Queue::open(QueueConfig::default()).unwrap();
    let id = queue.send(&ping("hello")).unwrap();

    let job = queue.get(id).unwrap();
    assert_eq!(job.state, State::Archived);
    assert_eq!(
        job.error.as_deref(),
        Some("no handler registered for type PingMsg")
    );
}

#[test]
fn failing_handler_keeps_the_committed_row() {
    let queue = Queue::builder(QueueConfig::default())
        .register("Flaky", |_: &JobContext, _: serde_json::Value| -> HandlerResult {
            Err("downstream unavailable".into())
        })
        .unwrap()
        .register("Panicky", |_: &JobContext, _: serde_json::Value| -> HandlerResult {
            panic!("inside hook")
        })
        .unwrap()
        .open()
        .unwrap();

    let flaky = queue.send_json("Flaky", &serde_json::json!({})).unwrap();
    let panicky = queue.send_json("Panicky", &serde_json::json!({})).unwrap();

    let flaky = queue.get(flaky).unwrap();
    assert_eq!(flaky.state, State::Archived);
    assert_eq!(flaky.error.as_deref(), Some("downstream unavailable"));

    let panicky = queue.get(panicky).unwrap();
    assert_eq!(panicky.state, State::Archived);
    assert_eq!(panicky.error.as_deref(), Some("handler panicked: inside hook"));
}

/// Sends a follow-up job on the queue it is itself running on.
fn chaining_queue(config: QueueConfig) -> Queue {
    let slot: Arc<OnceLock<Queue>> = Arc::new(OnceLock::new());
    let own = Arc::clone(&slot);
    let queue = Queue::builder(config)
        .register("Parent", move |_: &JobContext, _: serde_json::Value| -> HandlerResult {
            let queue = own.get().ok_or("queue not ready")?;
            queue.send(&ping("child"))?;
            Ok(())
        })
        .unwrap()
        .handle(|_: &JobContext, _: PingMsg| Ok(()))
        .unwrap()
        .open()
        .unwrap();
    slot.set(queue.clone()).unwrap();
    queue
}

#[test]
fn handler_calling_back_into_its_queue_fails_instead_of_hanging() {
    let queue = chaining_queue(QueueConfig::default());

    let parent = queue.send_json("Parent", &serde_json::json!({})).unwrap();

    let parent = queue.get(parent).unwrap();
    assert_eq!(parent.state, State::Archived);
    assert!(
        parent
            .error
            .as_deref()
            .unwrap()
            .contains("cannot call back into its own queue")
    );
    assert_eq!(queue.jobs().unwrap().len(), 1);
    queue.close().unwrap();
}

#[test]
fn poll_path_handlers_may_send_follow_ups() {
    let queue = chaining_queue(QueueConfig::default().commit_hook(false));

    let parent = queue.send_json("Parent", &serde_json::json!({})).unwrap();
    queue.beat().unwrap();

    assert_eq!(queue.get(parent).unwrap().state, State::Completed);
    let children = queue.get_by_state(State::Enqueued, 10).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].job_type, "PingMsg");
    queue.close().unwrap();
}

/// Records every notification and reads the row through the handed-over
/// connection.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(WriteOp, String, i64, String)>>,
}

impl CommitObserver for Recorder {
    fn on_write(
        &self,
        conn: &Connection,
        op: WriteOp,
        table: &str,
        row_id: i64,
    ) -> rowq::Result<()> {
        let status: String = conn.query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            [row_id],
            |row| row.get(0),
        )?;
        self.seen
            .lock()
            .unwrap()
            .push((op, table.to_string(), row_id, status));
        Ok(())
    }
}

#[test]
fn extra_observers_see_inserts_and_outcome_writes() {
    let recorder = Arc::new(Recorder::default());
    let queue = Queue::builder(QueueConfig::default())
        .handle(|_: &JobContext, _: PingMsg| Ok(()))
        .unwrap()
        .observe(recorder.clone())
        .open()
        .unwrap();

    let id = queue.send(&ping("hello")).unwrap();

    let seen = recorder.seen.lock().unwrap();
    let ops: Vec<WriteOp> = seen.iter().map(|(op, ..)| *op).collect();
    assert_eq!(ops, [WriteOp::Insert, WriteOp::Update]);
    assert!(seen.iter().all(|(_, table, row, _)| table == "jobs" && *row == id.0));
    // The jobs observer runs first, so the insert is already settled.
    assert_eq!(seen[0].3, "completed");
}

#[test]
fn observer_errors_do_not_undo_the_commit() {
    struct Failing;

    impl CommitObserver for Failing {
        fn on_write(&self, _: &Connection, _: WriteOp, _: &str, _: i64) -> rowq::Result<()> {
            Err(rowq::Error::Other("observer down".into()))
        }
    }

    let queue = Queue::builder(QueueConfig::default().commit_hook(false))
        .observe(Arc::new(Failing))
        .open()
        .unwrap();

    let id = queue.send(&ping("kept")).unwrap();
    assert_eq!(queue.get(id).unwrap().state, State::Enqueued);
}

#[test]
fn hook_and_poll_paths_share_one_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    // A producer-only process leaves rows behind...
    let producer = Queue::open(QueueConfig::file(&path).commit_hook(false)).unwrap();
    let old = producer.send(&ping("old")).unwrap();
    producer.close().unwrap();

    // ...which the consumer's poll path picks up, while its own sends go
    // through the hook.
    let consumer = Queue::builder(QueueConfig::file(&path))
        .handle(|_: &JobContext, _: PingMsg| Ok(()))
        .unwrap()
        .open()
        .unwrap();
    let fresh = consumer.send(&ping("fresh")).unwrap();
    assert_eq!(consumer.get(fresh).unwrap().state, State::Completed);
    assert_eq!(consumer.get(old).unwrap().state, State::Enqueued);

    let report = consumer.beat().unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].id, old);
    assert_eq!(consumer.get(old).unwrap().state, State::Completed);
}
