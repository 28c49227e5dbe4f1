use std::sync::Arc;
use std::time::Duration;

use sked_store::ExecutionStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::Result;

/// Returns executions whose owner stopped heartbeating to the due pool.
pub(crate) struct DeadExecutionDetector {
    pub(crate) scheduler_name: String,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Heartbeat age after which an owner is presumed dead.
    pub(crate) threshold: chrono::Duration,
}

impl DeadExecutionDetector {
    pub(crate) async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!(scheduler = %self.scheduler_name, error = %e, "dead execution sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(scheduler = %self.scheduler_name, "dead execution detector stopped");
    }

    /// Release every stale execution. Returns how many this sweep recovered;
    /// candidates another instance got to first are skipped.
    pub(crate) fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.threshold;

        let mut recovered = 0;
        for dead in self.store.get_dead_executions(cutoff)? {
            // re-read so the release uses the current version
            let Some(current) = self
                .store
                .get_execution(dead.task_name(), dead.instance_id())?
            else {
                continue;
            };
            if !current.picked {
                continue;
            }
            if self.store.release_dead(&current, cutoff, now)? {
                recovered += 1;
                warn!(
                    execution = %current.key(),
                    picked_by = current.picked_by.as_deref().unwrap_or("-"),
                    last_heartbeat = ?current.last_heartbeat,
                    "released dead execution"
                );
            } else {
                debug!(execution = %current.key(), "dead execution already recovered");
            }
        }
        Ok(recovered)
    }
}
