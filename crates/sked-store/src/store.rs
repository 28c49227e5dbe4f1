use chrono::{DateTime, Utc};
use sked_core::Execution;

use crate::error::Result;

/// Persistence contract the scheduler relies on.
///
/// Implementations must make every method a single atomic statement (or an
/// equivalent). Ownership-guarded writes (`reschedule`, `remove`) fail with a
/// consistency violation when they do not touch exactly one row; racy writes
/// (`pick`, `update_heartbeat`, `release_dead`) report a lost race as a
/// normal outcome instead.
pub trait ExecutionStore: Send + Sync {
    /// Insert `execution` unless its `(task_name, id)` already exists.
    ///
    /// Returns `false` when the key is taken, including when a concurrent
    /// writer inserted it between the existence check and the insert.
    fn create_if_not_exists(&self, execution: &Execution) -> Result<bool>;

    fn get_execution(&self, task_name: &str, instance_id: &str) -> Result<Option<Execution>>;

    /// Unpicked executions with `execution_time <= now`, oldest first.
    fn lock_and_fetch_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Execution>>;

    /// Claim `execution` for `picked_by` if it is still unpicked at the
    /// version the caller read. `None` means another instance won.
    fn pick(
        &self,
        execution: &Execution,
        picked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>>;

    /// Refresh `last_heartbeat` without bumping the version. `false` means
    /// the row no longer exists at this version.
    fn update_heartbeat(&self, execution: &Execution, now: DateTime<Utc>) -> Result<bool>;

    /// Unpick and move to the next occurrence, recording the outcome.
    fn reschedule(&self, execution: &Execution, update: &Reschedule) -> Result<()>;

    fn remove(&self, execution: &Execution) -> Result<()>;

    /// Picked executions whose last heartbeat is at or before `older_than`.
    fn get_dead_executions(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>>;

    /// Return a dead execution to the due pool as a failed attempt, provided
    /// it is still picked at the same version and its heartbeat is still
    /// stale. `false` means someone else already recovered or refreshed it.
    fn release_dead(
        &self,
        execution: &Execution,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    fn get_scheduled_executions(&self, filter: &ScheduledFilter) -> Result<Vec<Execution>>;

    /// Executions whose last failure is newer than their last success and
    /// that have not succeeded since `since`.
    fn get_executions_failing_longer_than(&self, since: DateTime<Utc>) -> Result<Vec<Execution>>;
}

/// New bookkeeping for an execution that is being unpicked and moved.
#[derive(Debug, Clone, PartialEq)]
pub struct Reschedule {
    pub execution_time: DateTime<Utc>,
    /// Replaces `task_data` when set; otherwise the payload is untouched.
    pub new_data: Option<Vec<u8>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Reschedule {
    pub fn success(execution: &Execution, next: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            execution_time: next,
            new_data: None,
            last_success: Some(now),
            last_failure: execution.last_failure,
            consecutive_failures: 0,
        }
    }

    pub fn failure(execution: &Execution, next: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            execution_time: next,
            new_data: None,
            last_success: execution.last_success,
            last_failure: Some(now),
            consecutive_failures: execution.consecutive_failures.saturating_add(1),
        }
    }

    /// Move the execution without recording an outcome.
    pub fn keep_state(execution: &Execution, next: DateTime<Utc>) -> Self {
        Self {
            execution_time: next,
            new_data: None,
            last_success: execution.last_success,
            last_failure: execution.last_failure,
            consecutive_failures: execution.consecutive_failures,
        }
    }

    pub fn with_data(mut self, data: Option<Vec<u8>>) -> Self {
        self.new_data = data;
        self
    }
}

/// Administrative listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledFilter {
    pub picked: Option<bool>,
    pub task_name: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ScheduledFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn picked() -> Self {
        Self {
            picked: Some(true),
            ..Self::default()
        }
    }

    pub fn unpicked() -> Self {
        Self {
            picked: Some(false),
            ..Self::default()
        }
    }

    pub fn for_task(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}
