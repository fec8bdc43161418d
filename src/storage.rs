//! SQLite storage layer.
//!
//! Owns the single connection and the `jobs` table. Rows are appended by
//! producers and only ever moved forward through the state machine; nothing
//! here deletes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use tracing::{error, trace, warn};

use crate::error::{Error, Result};
use crate::hook::{CommitObserver, PendingWrites};
use crate::model::*;

pub const JOBS_TABLE: &str = "jobs";

const JOB_COLUMNS: &str = "id, type, status, created_at, updated_at, payload, error";

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
    /// Present once an observer is registered; fed by the connection's hooks.
    pending: Option<PendingWrites>,
    observers: Vec<Arc<dyn CommitObserver>>,
}

/// Handle for performing storage operations within a transaction.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn insert_job(&self, job_type: &str, payload: &[u8]) -> Result<JobId> {
        insert_job_on(self.tx, job_type, payload, Utc::now())
    }
}

/// What a guarded state write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row moved `from` -> `to`.
    Applied { from: State, to: State },
    /// The row was no longer in a state this write applies to.
    Skipped { current: State },
}

/// Drain rounds per commit before observer-triggered writes stop being
/// reported.
pub const MAX_NOTIFY_ROUNDS: usize = 16;

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL so external readers do not block the writer
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                type        TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'enqueued',
                created_at  INTEGER,
                updated_at  INTEGER NULL,
                payload     JSON,
                error       TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id);
            ",
        )?;

        Ok(Self {
            conn,
            pending: None,
            observers: Vec::new(),
        })
    }

    /// Register an observer for committed row writes.
    ///
    /// The first observer installs the connection's update and rollback
    /// hooks. Observers run on this connection after each successful write.
    pub fn add_observer(&mut self, observer: Arc<dyn CommitObserver>) {
        if self.pending.is_none() {
            self.pending = Some(PendingWrites::install(&self.conn));
        }
        self.observers.push(observer);
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    /// The raw connection, for callers that already hold the guard.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    /// Observers are notified only after the commit.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        self.notify_committed();
        Ok(result)
    }

    /// Hand every buffered row write to the observers.
    ///
    /// Observer writes land in the buffer too, so drain until it stays empty,
    /// for at most [`MAX_NOTIFY_ROUNDS`] rounds. Whatever is still buffered
    /// after that is dropped with a warning.
    fn notify_committed(&self) {
        let Some(pending) = &self.pending else {
            return;
        };

        for _ in 0..MAX_NOTIFY_ROUNDS {
            let writes = pending.take();
            if writes.is_empty() {
                return;
            }
            for write in writes {
                trace!(op = ?write.op, table = %write.table, row_id = write.row_id, "row committed");
                for observer in &self.observers {
                    if let Err(e) =
                        observer.on_write(&self.conn, write.op, &write.table, write.row_id)
                    {
                        error!(
                            op = ?write.op,
                            table = %write.table,
                            row_id = write.row_id,
                            "commit observer failed: {e}"
                        );
                    }
                }
            }
        }

        let dropped = pending.take();
        if !dropped.is_empty() {
            warn!(
                dropped = dropped.len(),
                rounds = MAX_NOTIFY_ROUNDS,
                "commit observers kept writing; notifications dropped"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert a new job in `Enqueued` state inside one transaction.
    pub fn insert_job(&mut self, job_type: &str, payload: &[u8]) -> Result<JobId> {
        self.with_transaction(|ctx| ctx.insert_job(job_type, payload))
    }

    /// Get a job by id.
    pub fn get_job(&self, id: JobId) -> Result<Job> {
        get_job_on(&self.conn, id)
    }

    /// List jobs in `state`, oldest first.
    pub fn list_by_state(&self, state: State, limit: usize) -> Result<Vec<Job>> {
        list_by_state_on(&self.conn, state, limit)
    }

    /// Jobs a poll tick should look at: `Enqueued`, plus `Active` rows whose
    /// dispatch never recorded an outcome. Oldest first.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN (?1, ?2) ORDER BY id ASC LIMIT ?3"
        ))?;
        let jobs = stmt
            .query_map(
                params![State::Enqueued, State::Active, sql_limit(limit)],
                row_to_job,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Every job, in id order.
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC"))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Number of jobs per state. States with no rows are omitted.
    pub fn count_by_state(&self) -> Result<BTreeMap<State, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, State>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts
            .into_iter()
            .map(|(state, n)| (state, u64::try_from(n).unwrap_or_default()))
            .collect())
    }

    /// Mark a job as being dispatched. See [`activate_on`].
    pub fn activate(&self, id: JobId) -> Result<Option<Job>> {
        let job = activate_on(&self.conn, id)?;
        self.notify_committed();
        Ok(job)
    }

    /// Record a terminal outcome. See [`finish_on`].
    pub fn finish(&self, id: JobId, outcome: &Outcome) -> Result<Transition> {
        let transition = finish_on(&self.conn, id, outcome)?;
        self.notify_committed();
        Ok(transition)
    }

    /// Close the connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Storage(e))
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept &Connection so they work with the owned
// connection, a transaction, or the connection handed to a commit observer.
// ---------------------------------------------------------------------------

fn insert_job_on(
    conn: &Connection,
    job_type: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<JobId> {
    conn.execute(
        "INSERT INTO jobs (type, status, created_at, payload) VALUES (?1, ?2, ?3, ?4)",
        params![job_type, State::Enqueued, to_nanos(now), payload],
    )?;
    Ok(JobId(conn.last_insert_rowid()))
}

pub(crate) fn find_job_on(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.0],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

pub(crate) fn get_job_on(conn: &Connection, id: JobId) -> Result<Job> {
    find_job_on(conn, id)?.ok_or(Error::NotFound(id))
}

fn get_state_on(conn: &Connection, id: JobId) -> Result<State> {
    conn.query_row(
        "SELECT status FROM jobs WHERE id = ?1",
        params![id.0],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::NotFound(id))
}

fn list_by_state_on(conn: &Connection, state: State, limit: usize) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY id ASC LIMIT ?2"
    ))?;
    let jobs = stmt
        .query_map(params![state, sql_limit(limit)], row_to_job)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Claim a job for dispatch by moving `Enqueued` to `Active`.
///
/// Returns the job as it stands afterwards. An `Active` row is returned
/// untouched (a previous dispatch never recorded its outcome). Terminal and
/// reserved states yield `None`.
pub(crate) fn activate_on(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let Some(mut job) = find_job_on(conn, id)? else {
        return Err(Error::NotFound(id));
    };

    match job.state {
        State::Active => Ok(Some(job)),
        State::Enqueued => {
            let now = Utc::now();
            let changed = conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![State::Active, to_nanos(now), id.0, State::Enqueued],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            job.state = State::Active;
            job.updated_at = Some(now);
            Ok(Some(job))
        }
        _ => Ok(None),
    }
}

/// Write a terminal outcome: state, `updated_at` and `error` in one statement.
///
/// A row that is already terminal is left alone and reported as skipped, so
/// re-delivery of the same job is a no-op.
pub(crate) fn finish_on(conn: &Connection, id: JobId, outcome: &Outcome) -> Result<Transition> {
    let from = get_state_on(conn, id)?;
    if from.is_terminal() {
        return Ok(Transition::Skipped { current: from });
    }

    let to = outcome.state();
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    let changed = conn.execute(
        "UPDATE jobs SET status = ?1, updated_at = ?2, error = ?3 WHERE id = ?4 AND status = ?5",
        params![
            to,
            to_nanos(Utc::now()),
            outcome.error_message(),
            id.0,
            from
        ],
    )?;

    if changed == 0 {
        return Ok(Transition::Skipped {
            current: get_state_on(conn, id)?,
        });
    }

    Ok(Transition::Applied { from, to })
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let created: Option<i64> = row.get(3)?;
    let updated: Option<i64> = row.get(4)?;
    let payload = match row.get_ref(5)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => bytes.to_vec(),
        ValueRef::Null => Vec::new(),
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                5,
                other.data_type(),
                "payload must be text or blob".into(),
            ));
        }
    };

    Ok(Job {
        id: JobId(row.get(0)?),
        job_type: row.get(1)?,
        state: row.get(2)?,
        payload,
        created_at: from_nanos(created.unwrap_or_default()),
        updated_at: updated.map(from_nanos),
        error: row.get(6)?,
    })
}

impl ToSql for State {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for State {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
