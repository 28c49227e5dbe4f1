use sked_core::{CoreError, ExecutionKey};
use sked_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionKey),

    /// The execution is picked by some scheduler instance.
    #[error("Execution is currently running: {0}")]
    ExecutionRunning(ExecutionKey),

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("No task registered under '{0}'")]
    UnknownTask(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Scheduler is already started")]
    AlreadyStarted,

    #[error("Scheduler is not running")]
    NotRunning,
}

impl SchedulerError {
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_consistency_violation())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure raised by a task body. Always converted into a retry with backoff.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid task data: {0}")]
    Data(#[from] CoreError),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}
