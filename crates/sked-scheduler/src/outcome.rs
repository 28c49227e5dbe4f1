use chrono::{DateTime, Utc};
use sked_core::SchedulableInstance;

/// What a finished execution asks the scheduler to do with its row.
///
/// The set is closed; [`crate::completion::CompletionHandler`] applies every
/// variant with one exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Success of a recurring task: move to `next_time`, reset failures,
    /// optionally replacing the payload.
    RescheduleRecurring {
        next_time: DateTime<Utc>,
        new_data: Option<Vec<u8>>,
    },

    /// Success of a one-off task: delete the row.
    Remove,

    /// Failure: move to a backoff-derived time and count the failure.
    RetryWithBackoff,

    /// Chaining: insert `next` if absent, then delete the current row.
    RemoveAndScheduleNew(SchedulableInstance),
}

impl CompletionOutcome {
    pub fn reschedule(next_time: DateTime<Utc>) -> Self {
        CompletionOutcome::RescheduleRecurring {
            next_time,
            new_data: None,
        }
    }

    pub fn chain(next: SchedulableInstance) -> Self {
        CompletionOutcome::RemoveAndScheduleNew(next)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CompletionOutcome::RescheduleRecurring { .. } => "reschedule",
            CompletionOutcome::Remove => "remove",
            CompletionOutcome::RetryWithBackoff => "retry",
            CompletionOutcome::RemoveAndScheduleNew(_) => "chain",
        }
    }
}
