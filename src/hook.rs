//! Commit notifications.
//!
//! SQLite reports row writes through its update hook, but the hook fires
//! mid-statement and must not touch the connection. So the hook only records
//! `(op, table, rowid)`; [`Storage`](crate::storage::Storage) drains the
//! buffer after each commit and hands every write to the registered
//! [`CommitObserver`]s together with the connection that made it.

use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::Connection;
use rusqlite::hooks::Action;
use tracing::trace;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::model::{JobId, Trigger};
use crate::storage::JOBS_TABLE;

/// Kind of row write reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// Reacts to committed row writes.
///
/// `conn` is the connection that performed the write; the caller already
/// owns it exclusively, so observers must use it rather than going back
/// through the queue.
///
/// Writes an observer makes through `conn` are reported to every observer
/// in the next drain round. A commit is drained for at most
/// [`MAX_NOTIFY_ROUNDS`](crate::storage::MAX_NOTIFY_ROUNDS) rounds, so an
/// observer that writes on every notification is cut off there.
pub trait CommitObserver: Send + Sync {
    fn on_write(&self, conn: &Connection, op: WriteOp, table: &str, row_id: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct RowWrite {
    pub op: WriteOp,
    pub table: String,
    pub row_id: i64,
}

/// Row writes seen by the update hook since the last drain.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingWrites(Arc<Mutex<Vec<RowWrite>>>);

impl PendingWrites {
    /// Install update and rollback hooks on `conn` feeding a fresh buffer.
    pub fn install(conn: &Connection) -> Self {
        let pending = Self::default();

        let sink = pending.clone();
        conn.update_hook(Some(
            move |action: Action, _db: &str, table: &str, row_id: i64| {
                let op = match action {
                    Action::SQLITE_INSERT => WriteOp::Insert,
                    Action::SQLITE_UPDATE => WriteOp::Update,
                    Action::SQLITE_DELETE => WriteOp::Delete,
                    _ => return,
                };
                sink.push(RowWrite {
                    op,
                    table: table.to_string(),
                    row_id,
                });
            },
        ));

        // Writes from a rolled-back transaction never happened.
        let sink = pending.clone();
        conn.rollback_hook(Some(move || sink.clear()));

        pending
    }

    fn push(&self, write: RowWrite) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(write);
    }

    fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn take(&self) -> Vec<RowWrite> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Feeds freshly inserted job rows straight to the dispatcher.
pub struct JobsObserver {
    dispatcher: Arc<Dispatcher>,
}

impl JobsObserver {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl CommitObserver for JobsObserver {
    fn on_write(&self, conn: &Connection, op: WriteOp, table: &str, row_id: i64) -> Result<()> {
        if table != JOBS_TABLE {
            return Ok(());
        }

        match op {
            WriteOp::Insert => {
                self.dispatcher
                    .dispatch_on(conn, JobId(row_id), Trigger::CommitHook)?;
            }
            WriteOp::Update | WriteOp::Delete => {
                trace!(?op, row_id, "jobs row write observed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_buffer_writes_and_drop_rolled_back_ones() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .unwrap();
        let pending = PendingWrites::install(&conn);

        conn.execute("INSERT INTO t (v) VALUES ('a')", []).unwrap();
        conn.execute("UPDATE t SET v = 'b' WHERE id = 1", []).unwrap();

        let writes = pending.take();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].op, WriteOp::Insert);
        assert_eq!(writes[0].table, "t");
        assert_eq!(writes[0].row_id, 1);
        assert_eq!(writes[1].op, WriteOp::Update);
        assert!(pending.take().is_empty());

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO t (v) VALUES ('c')", []).unwrap();
        tx.rollback().unwrap();
        assert!(pending.take().is_empty());
    }
}
