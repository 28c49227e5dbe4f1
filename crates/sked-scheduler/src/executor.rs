use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use sked_core::{Execution, ExecutionKey};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::completion::{Applied, CompletionHandler};
use crate::outcome::CompletionOutcome;
use crate::registry::TaskRegistry;
use crate::task::ExecutionContext;

/// An execution this scheduler instance has picked and not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentlyExecuting {
    /// The row as returned by the pick; its version guards every later write.
    pub execution: Execution,
    pub picked_at: DateTime<Utc>,
    /// `false` while no task is registered under the execution's name.
    pub task_resolved: bool,
    /// Set by the heartbeat loop once the row no longer matches this version.
    pub ownership_lost: bool,
    /// Last heartbeat the store accepted for this pick.
    pub confirmed_heartbeat: Option<DateTime<Utc>>,
}

pub(crate) type ExecutingMap = Arc<DashMap<ExecutionKey, CurrentlyExecuting>>;

/// Runs one picked execution to completion.
pub(crate) struct Executor {
    pub(crate) scheduler_name: String,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) completion: CompletionHandler,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) executing: ExecutingMap,
}

impl Executor {
    pub(crate) async fn run(&self, execution: Execution) {
        let key = execution.key();

        let Some(task) = self.registry.resolve(execution.task_name()) else {
            // stays in the executing map so the heartbeat keeps it alive
            error!(
                execution = %key,
                scheduler = %self.scheduler_name,
                "no task registered under this name; execution left picked until resolved"
            );
            if let Some(mut entry) = self.executing.get_mut(&key) {
                entry.task_resolved = false;
            }
            return;
        };

        let ctx = ExecutionContext {
            execution: execution.clone(),
            scheduler_name: self.scheduler_name.clone(),
            started_at: self.clock.now(),
        };
        debug!(execution = %key, version = execution.version, "executing");

        let run = task.execute(&execution.task_instance, &ctx);
        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(execution = %key, error = %e, "task failed");
                CompletionOutcome::RetryWithBackoff
            }
            Err(_) => {
                error!(execution = %key, "task panicked");
                CompletionOutcome::RetryWithBackoff
            }
        };

        let (lost, confirmed_heartbeat) = self
            .executing
            .get(&key)
            .map_or((false, execution.last_heartbeat), |entry| {
                (entry.ownership_lost, entry.confirmed_heartbeat)
            });
        if lost {
            warn!(
                execution = %key,
                outcome = outcome.label(),
                "ownership lost while running, discarding result"
            );
        } else {
            match self.completion.apply_since(&execution, outcome, confirmed_heartbeat) {
                Ok(Applied::Written) => info!(execution = %key, "execution completed"),
                Ok(Applied::Discarded) => {}
                Err(e) if e.is_consistency_violation() => {
                    error!(execution = %key, error = %e, "consistency violation completing execution")
                }
                Err(e) => error!(execution = %key, error = %e, "failed to complete execution"),
            }
        }

        self.executing.remove(&key);
    }
}
