use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Reject anything that is not a plain SQL identifier; the table name is
/// interpolated into every statement.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

/// Initialise the executions table in `conn`.
///
/// Idempotent. `(task_name, task_instance)` is the primary key, so a second
/// insert for the same instance surfaces as a constraint violation.
pub fn init_db(conn: &Connection, table: &str) -> Result<()> {
    validate_table_name(table)?;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            task_name            TEXT    NOT NULL,
            task_instance        TEXT    NOT NULL,
            task_data            BLOB,
            execution_time       TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            picked               INTEGER NOT NULL DEFAULT 0,
            picked_by            TEXT,
            last_success         TEXT,
            last_failure         TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_heartbeat       TEXT,
            version              INTEGER NOT NULL,
            PRIMARY KEY (task_name, task_instance)
        );

        -- due fetch: WHERE picked = 0 AND execution_time <= ? ORDER BY execution_time
        CREATE INDEX IF NOT EXISTS idx_{table}_execution_time ON {table} (execution_time);
        -- dead detection: WHERE picked = 1 AND last_heartbeat <= ?
        CREATE INDEX IF NOT EXISTS idx_{table}_last_heartbeat ON {table} (last_heartbeat);
        "
    ))?;
    Ok(())
}
