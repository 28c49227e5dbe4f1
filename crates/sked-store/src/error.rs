use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Write that the caller performs while holding logical ownership of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Picked,
    Updated,
    Removed,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mutation::Picked => "picked",
            Mutation::Updated => "updated",
            Mutation::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur within the execution store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Insert collided with an existing primary key.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Failed to add new execution.")]
    InsertFailed {
        #[source]
        source: Box<StoreError>,
    },

    /// A unique-key lookup matched several rows: the table is corrupt.
    #[error(
        "Found more than one matching execution for task name/id combination: '{task_name}'/'{instance_id}'"
    )]
    MultipleExecutions {
        task_name: String,
        instance_id: String,
    },

    /// An ownership-guarded write touched zero or several rows.
    #[error("Expected one execution to be {operation}, but {operation} {affected}. Indicates a bug.")]
    ConsistencyViolation { operation: Mutation, affected: usize },

    #[error("Inconsistent store state: {0}")]
    Inconsistent(String),

    /// Timestamp outside years 0..=9999, which the text column cannot order.
    #[error("Instant {0} is outside the storable range (years 0 to 9999)")]
    InstantOutOfRange(DateTime<Utc>),

    #[error("Invalid row: {0}")]
    Decode(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// True for faults that signal a broken invariant rather than an
    /// infrastructure hiccup.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ConsistencyViolation { .. }
                | StoreError::MultipleExecutions { .. }
                | StoreError::Inconsistent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_messages_name_expected_and_actual_counts() {
        let err = StoreError::ConsistencyViolation {
            operation: Mutation::Updated,
            affected: 0,
        };
        assert_eq!(
            err.to_string(),
            "Expected one execution to be updated, but updated 0. Indicates a bug."
        );

        let err = StoreError::ConsistencyViolation {
            operation: Mutation::Removed,
            affected: 2,
        };
        assert_eq!(
            err.to_string(),
            "Expected one execution to be removed, but removed 2. Indicates a bug."
        );
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn insert_failure_keeps_root_cause() {
        use std::error::Error;
        let err = StoreError::InsertFailed {
            source: Box::new(StoreError::Database(rusqlite::Error::InvalidQuery)),
        };
        assert_eq!(err.to_string(), "Failed to add new execution.");
        let cause = err.source().unwrap();
        assert!(cause.to_string().contains("Database error"));
        assert!(!err.is_consistency_violation());
    }
}
