//! Connection helper: one owned SQLite connection plus script execution in
//! explicit transaction modes.
//!
//! # Responsibility
//! - Own the session connection for its whole lifetime.
//! - Run parameterized scripts in `NoTx`, serializable read-write or
//!   snapshot read-only mode.
//! - Stream result rows into caller-supplied materializers.
//! - Run interactive multi-statement transactions.
//!
//! # Invariants
//! - Every mutation runs in `SerializableReadWrite`; every pure read runs in
//!   `SnapshotReadOnly`, which rejects writes.
//! - A failed call leaves no partial commit behind.
//! - `close` consumes the session, so a session cannot be closed twice.

use crate::config::DatabaseConfig;
use crate::db::{open_db, open_db_in_memory, DbError, DbResult};
use log::{debug, warn};
use rusqlite::{Connection, InterruptHandle, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

mod materialize;
mod params;
mod script;

pub use materialize::{column_list, materialize, FromRow};
pub use params::Params;
pub use script::RowSink;

pub(crate) use script::{check_cancelled, execution_error};
use script::run_script;

pub type QueryResult<T> = Result<T, QueryError>;

/// Failure of a statement, script or result stream.
#[derive(Debug)]
pub enum QueryError {
    /// The engine rejected a statement (constraint, conflict, busy, read-only).
    Execution(rusqlite::Error),
    /// Iteration or row decoding failed after the statement started.
    Stream(rusqlite::Error),
    /// A statement references a parameter that was not supplied.
    UnboundParameter(String),
    /// A parameter value could not be encoded for binding.
    InvalidParameter { name: String, reason: String },
    /// The session's cancellation token fired or the statement was interrupted.
    Cancelled,
}

impl QueryError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Cancelled)
    }
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution(err) => write!(f, "statement rejected: {err}"),
            Self::Stream(err) => write!(f, "result stream failed: {err}"),
            Self::UnboundParameter(name) => write!(f, "parameter `{name}` is not bound"),
            Self::InvalidParameter { name, reason } => {
                write!(f, "parameter `{name}` cannot be bound: {reason}")
            }
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Execution(err) | Self::Stream(err) => Some(err),
            Self::UnboundParameter(_) | Self::InvalidParameter { .. } | Self::Cancelled => None,
        }
    }
}

/// Transaction control for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Autocommit per statement.
    NoTx,
    /// One write transaction for the whole script, committed on success.
    SerializableReadWrite,
    /// One consistent read snapshot; writes fail.
    SnapshotReadOnly,
}

impl TxMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::NoTx => "no_tx",
            Self::SerializableReadWrite => "serializable_rw",
            Self::SnapshotReadOnly => "snapshot_ro",
        }
    }
}

/// Owned database session.
pub struct Session {
    conn: Connection,
    path: Option<PathBuf>,
    busy_timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl Session {
    /// Opens (and bootstraps) the database file named by `config`.
    pub fn open(config: &DatabaseConfig) -> DbResult<Self> {
        let busy_timeout = config.busy_timeout();
        let conn = open_db(&config.path, busy_timeout)?;
        Ok(Self {
            conn,
            path: Some(config.path.clone()),
            busy_timeout,
            cancel: None,
        })
    }

    /// Opens a private in-memory database.
    ///
    /// Repository and bulk operations work as usual; topic readers and
    /// writers need a file-backed session.
    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self {
            conn: open_db_in_memory()?,
            path: None,
            busy_timeout: Duration::ZERO,
            cancel: None,
        })
    }

    /// Attaches a cancellation token checked before every statement and row.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Database file path; `None` for in-memory sessions.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// Handle that aborts the statement currently running on this session.
    /// The interrupted call fails with `QueryError::Cancelled`.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    /// Runs a script that produces no rows of interest.
    pub fn execute(&self, sql: &str, params: &Params, mode: TxMode) -> QueryResult<()> {
        self.query(sql, params, mode, |_, _| Ok(()))
    }

    /// Runs a script and passes every row of every result set to `on_row`.
    ///
    /// The first error (statement, stream or `on_row`) aborts the call and
    /// rolls back the transaction of the given mode.
    pub fn query<F>(&self, sql: &str, params: &Params, mode: TxMode, mut on_row: F) -> QueryResult<()>
    where
        F: FnMut(usize, &Row<'_>) -> QueryResult<()>,
    {
        let started_at = Instant::now();
        let cancel = self.cancel.as_ref();
        let result = self.in_mode(mode, |conn| run_script(conn, sql, params, cancel, &mut on_row));

        match &result {
            Ok(()) => debug!(
                "event=query module=query status=ok mode={} duration_ms={}",
                mode.as_str(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=query module=query status=error mode={} duration_ms={} error={}",
                mode.as_str(),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    /// Runs `body` inside one serializable transaction.
    ///
    /// Statements issued through the handle observe each other's writes.
    /// The transaction commits when `body` returns `Ok` and rolls back
    /// otherwise, surfacing `body`'s error unchanged.
    pub fn run_in_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<T, E>,
        E: From<QueryError>,
    {
        check_cancelled(self.cancel.as_ref())?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(execution_error)?;
        let handle = TxHandle {
            tx,
            cancel: self.cancel.as_ref(),
        };

        let value = body(&handle)?;
        handle.tx.commit().map_err(execution_error)?;
        Ok(value)
    }

    /// Releases the connection.
    pub fn close(self) -> DbResult<()> {
        self.conn.close().map_err(|(_, err)| DbError::Sqlite(err))
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    fn in_mode<T>(
        &self,
        mode: TxMode,
        run: impl FnOnce(&Connection) -> QueryResult<T>,
    ) -> QueryResult<T> {
        check_cancelled(self.cancel.as_ref())?;
        match mode {
            TxMode::NoTx => run(&self.conn),
            TxMode::SerializableReadWrite => {
                let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
                    .map_err(execution_error)?;
                let value = run(&*tx)?;
                tx.commit().map_err(execution_error)?;
                Ok(value)
            }
            TxMode::SnapshotReadOnly => {
                let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)
                    .map_err(execution_error)?;
                tx.pragma_update(None, "query_only", true)
                    .map_err(execution_error)?;
                let result = run(&*tx);
                // query_only is connection-wide; it must be cleared even when the read failed.
                let reset = tx
                    .pragma_update(None, "query_only", false)
                    .map_err(execution_error);
                let value = result?;
                reset?;
                tx.commit().map_err(execution_error)?;
                Ok(value)
            }
        }
    }
}

/// Handle to an open interactive transaction.
pub struct TxHandle<'s> {
    tx: Transaction<'s>,
    cancel: Option<&'s CancellationToken>,
}

impl TxHandle<'_> {
    pub fn execute(&self, sql: &str, params: &Params) -> QueryResult<()> {
        self.query(sql, params, |_, _| Ok(()))
    }

    pub fn query<F>(&self, sql: &str, params: &Params, mut on_row: F) -> QueryResult<()>
    where
        F: FnMut(usize, &Row<'_>) -> QueryResult<()>,
    {
        run_script(&self.tx, sql, params, self.cancel, &mut on_row)
    }
}

#[cfg(test)]
mod tests {
    use super::{Params, QueryError, Session, TxMode};
    use tokio_util::sync::CancellationToken;

    fn scratch_session() -> Session {
        let session = Session::open_in_memory().unwrap();
        session
            .execute(
                "CREATE TABLE scratch (k INTEGER PRIMARY KEY, v TEXT NOT NULL);",
                &Params::new(),
                TxMode::NoTx,
            )
            .unwrap();
        session
    }

    fn count_rows(session: &Session) -> i64 {
        let mut count = 0;
        session
            .query(
                "SELECT COUNT(*) AS n FROM scratch;",
                &Params::new(),
                TxMode::SnapshotReadOnly,
                |_, row| {
                    count = row.get("n").map_err(QueryError::Stream)?;
                    Ok(())
                },
            )
            .unwrap();
        count
    }

    #[test]
    fn script_statements_share_named_parameters() {
        let session = scratch_session();
        let mut seen = Vec::new();
        session
            .query(
                "INSERT INTO scratch (k, v) VALUES (:k, :v);
                 SELECT k, v FROM scratch WHERE k = :k;",
                &Params::new().int(":k", 7).text(":v", "seven"),
                TxMode::SerializableReadWrite,
                |set, row| {
                    let value: String = row.get("v").map_err(QueryError::Stream)?;
                    seen.push((set, value));
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(seen, vec![(0, "seven".to_string())]);
    }

    #[test]
    fn missing_parameter_is_reported_by_name() {
        let session = scratch_session();
        let err = session
            .execute(
                "INSERT INTO scratch (k, v) VALUES (:k, :v);",
                &Params::new().int(":k", 1),
                TxMode::SerializableReadWrite,
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::UnboundParameter(name) if name == ":v"));
    }

    #[test]
    fn snapshot_mode_rejects_writes_and_recovers() {
        let session = scratch_session();
        let err = session
            .execute(
                "INSERT INTO scratch (k, v) VALUES (1, 'x');",
                &Params::new(),
                TxMode::SnapshotReadOnly,
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));

        session
            .execute(
                "INSERT INTO scratch (k, v) VALUES (1, 'x');",
                &Params::new(),
                TxMode::SerializableReadWrite,
            )
            .unwrap();
        assert_eq!(count_rows(&session), 1);
    }

    #[test]
    fn failing_script_rolls_back_earlier_statements() {
        let session = scratch_session();
        let err = session
            .execute(
                "INSERT INTO scratch (k, v) VALUES (1, 'a');
                 INSERT INTO scratch (k, v) VALUES (1, 'duplicate');",
                &Params::new(),
                TxMode::SerializableReadWrite,
            )
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(count_rows(&session), 0);
    }

    #[test]
    fn interactive_transaction_commits_or_discards_everything() {
        let session = scratch_session();

        session
            .run_in_transaction(|tx| -> Result<(), QueryError> {
                tx.execute("INSERT INTO scratch (k, v) VALUES (1, 'a');", &Params::new())?;
                tx.execute("INSERT INTO scratch (k, v) VALUES (2, 'b');", &Params::new())
            })
            .unwrap();
        assert_eq!(count_rows(&session), 2);

        let err = session
            .run_in_transaction(|tx| -> Result<(), QueryError> {
                tx.execute("INSERT INTO scratch (k, v) VALUES (3, 'c');", &Params::new())?;
                Err(QueryError::UnboundParameter(":late".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, QueryError::UnboundParameter(_)));
        assert_eq!(count_rows(&session), 2);
    }

    #[test]
    fn cancelled_session_refuses_new_calls() {
        let token = CancellationToken::new();
        let session = scratch_session().with_cancellation(token.clone());
        token.cancel();

        let err = session
            .execute("SELECT 1;", &Params::new(), TxMode::NoTx)
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }
}
