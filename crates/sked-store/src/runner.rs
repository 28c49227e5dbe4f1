use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{types::Value, Connection};
use sked_core::{Execution, TaskInstance};
use tracing::trace;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::query::{format_instant, is_storable, SqlParam};

/// Executes single parameterised statements against the backing store.
///
/// This is the seam between the SQL the repository renders and the driver
/// that runs it; tests swap in a scripted runner to assert on row counts.
pub trait SqlRunner: Send + Sync {
    /// Run an insert/update/delete and return the affected row count.
    ///
    /// A primary-key collision must surface as [`StoreError::DuplicateKey`].
    fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<usize>;

    /// Run a select over the executions table, mapping every row.
    fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Execution>>;
}

/// [`SqlRunner`] over a single SQLite connection.
///
/// Each scheduler instance should own its own connection (or its own
/// runner); SQLite serialises writers across connections and processes.
pub struct SqliteRunner {
    conn: Mutex<Connection>,
}

impl SqliteRunner {
    /// Wrap an already-open connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open (or create) a database file in WAL mode with a busy timeout so
    /// several processes can share it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// Create the executions table if it does not exist.
    pub fn init_schema(&self, table: &str) -> Result<()> {
        let conn = self.conn()?;
        init_db(&conn, table)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl SqlRunner for SqliteRunner {
    fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<usize> {
        trace!(%sql, "execute");
        let values = to_values(params)?;
        let conn = self.conn()?;
        conn.execute(sql, rusqlite::params_from_iter(values))
            .map_err(map_error)
    }

    fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Execution>> {
        trace!(%sql, "query");
        let values = to_values(params)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values))?;

        let mut executions = Vec::new();
        while let Some(row) = rows.next()? {
            executions.push(row_to_execution(row)?);
        }
        Ok(executions)
    }
}

/// Refuses instants whose text form would not sort or parse back.
fn to_values(params: &[SqlParam]) -> Result<Vec<Value>> {
    params
        .iter()
        .map(|p| {
            Ok(match p {
                SqlParam::Null => Value::Null,
                SqlParam::Bool(b) => Value::Integer(i64::from(*b)),
                SqlParam::Int(i) => Value::Integer(*i),
                SqlParam::Text(s) => Value::Text(s.clone()),
                SqlParam::Blob(b) => Value::Blob(b.clone()),
                SqlParam::Timestamp(t) if is_storable(*t) => Value::Text(format_instant(*t)),
                SqlParam::Timestamp(t) => return Err(StoreError::InstantOutOfRange(*t)),
            })
        })
        .collect()
}

/// Reinterpret key collisions; everything else stays a database fault.
fn map_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                ) =>
        {
            StoreError::DuplicateKey(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => StoreError::Database(err),
    }
}

/// Map a row of `select *` to an [`Execution`].
fn row_to_execution(row: &rusqlite::Row<'_>) -> Result<Execution> {
    let consecutive_failures: i64 = row.get("consecutive_failures")?;
    Ok(Execution {
        task_instance: TaskInstance {
            task_name: row.get("task_name")?,
            id: row.get("task_instance")?,
            data: row.get("task_data")?,
        },
        execution_time: parse_instant(&row.get::<_, String>("execution_time")?)?,
        picked: row.get("picked")?,
        picked_by: row.get("picked_by")?,
        last_heartbeat: parse_opt_instant(row.get("last_heartbeat")?)?,
        last_success: parse_opt_instant(row.get("last_success")?)?,
        last_failure: parse_opt_instant(row.get("last_failure")?)?,
        consecutive_failures: u32::try_from(consecutive_failures).map_err(|_| {
            StoreError::Decode(format!("consecutive_failures out of range: {consecutive_failures}"))
        })?,
        version: row.get("version")?,
    })
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_instant(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_instant).transpose()
}
