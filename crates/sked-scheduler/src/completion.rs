use std::sync::Arc;

use chrono::{DateTime, Utc};
use sked_core::Execution;
use sked_store::{ExecutionStore, Reschedule, StoreError};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::error::Result;
use crate::outcome::CompletionOutcome;

/// Result of applying a [`CompletionOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The store now reflects the outcome.
    Written,
    /// Ownership had moved on (the execution was recovered as dead and
    /// re-picked, rescheduled or finished elsewhere); the outcome was dropped.
    Discarded,
}

/// Closes the loop from a finished task back into the store.
pub struct CompletionHandler {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    dead_threshold: Option<chrono::Duration>,
}

impl CompletionHandler {
    pub fn new(store: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            clock,
            backoff,
            dead_threshold: None,
        }
    }

    /// Heartbeat age after which other instances may recover an execution.
    /// Without it a vanished row is always reported as a violation.
    pub fn with_dead_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.dead_threshold = Some(threshold);
        self
    }

    /// Apply `outcome` to `execution`, which must be the row as returned by
    /// the pick.
    pub fn apply(&self, execution: &Execution, outcome: CompletionOutcome) -> Result<Applied> {
        self.apply_since(execution, outcome, execution.last_heartbeat)
    }

    /// Like [`apply`](Self::apply), where `confirmed_heartbeat` is the last
    /// heartbeat the store accepted for this pick.
    pub fn apply_since(
        &self,
        execution: &Execution,
        outcome: CompletionOutcome,
        confirmed_heartbeat: Option<DateTime<Utc>>,
    ) -> Result<Applied> {
        let now = self.clock.now();
        let label = outcome.label();

        let written = match outcome {
            CompletionOutcome::RescheduleRecurring {
                next_time,
                new_data,
            } => self.store.reschedule(
                execution,
                &Reschedule::success(execution, next_time, now).with_data(new_data),
            ),
            CompletionOutcome::Remove => self.store.remove(execution),
            CompletionOutcome::RetryWithBackoff => {
                let next = self.backoff.next_attempt(execution, now);
                debug!(
                    execution = %execution.key(),
                    failures = execution.consecutive_failures + 1,
                    %next,
                    "retrying with backoff"
                );
                self.store
                    .reschedule(execution, &Reschedule::failure(execution, next, now))
            }
            CompletionOutcome::RemoveAndScheduleNew(next) => {
                // next step goes in first: a crash in between leaves both rows
                let next = next.into_execution();
                match self.store.create_if_not_exists(&next) {
                    Ok(true) => {
                        info!(execution = %execution.key(), next = %next.key(), "scheduled next step")
                    }
                    Ok(false) => warn!(
                        execution = %execution.key(),
                        next = %next.key(),
                        "next step already exists, not scheduling it again"
                    ),
                    Err(e) => return Err(e.into()),
                }
                self.store.remove(execution)
            }
        };

        match written {
            Ok(()) => {
                debug!(execution = %execution.key(), outcome = label, "completion applied");
                Ok(Applied::Written)
            }
            Err(e) => {
                let lost_race = matches!(e, StoreError::ConsistencyViolation { affected: 0, .. });
                if lost_race {
                    match self
                        .store
                        .get_execution(execution.task_name(), execution.instance_id())?
                    {
                        Some(current) if current.version > execution.version => {
                            warn!(
                                execution = %execution.key(),
                                version = execution.version,
                                outcome = label,
                                "execution was recovered by another owner while running, discarding result"
                            );
                            return Ok(Applied::Discarded);
                        }
                        None if self.heartbeat_lapsed(confirmed_heartbeat, now) => {
                            warn!(
                                execution = %execution.key(),
                                version = execution.version,
                                outcome = label,
                                "execution vanished after its heartbeat lapsed, assuming it was recovered and finished elsewhere"
                            );
                            return Ok(Applied::Discarded);
                        }
                        _ => {}
                    }
                }
                error!(execution = %execution.key(), outcome = label, error = %e, "failed to apply completion");
                Err(e.into())
            }
        }
    }

    /// True when another instance's dead-execution sweep could have released
    /// this pick: the last accepted heartbeat is at least the threshold old.
    fn heartbeat_lapsed(&self, confirmed_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.dead_threshold, confirmed_heartbeat) {
            (Some(threshold), Some(beat)) => now - beat >= threshold,
            _ => false,
        }
    }
}
