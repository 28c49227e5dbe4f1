use std::sync::Arc;
use std::time::Duration;

use sked_store::ExecutionStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::executor::ExecutingMap;

/// Refreshes `last_heartbeat` for everything this instance holds, on a timer
/// independent of the task bodies.
pub(crate) struct Heartbeat {
    pub(crate) scheduler_name: String,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) executing: ExecutingMap,
}

impl Heartbeat {
    pub(crate) async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the pick itself stamped the first heartbeat
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.beat_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(scheduler = %self.scheduler_name, "heartbeat stopped");
    }

    /// Returns how many executions were refreshed.
    pub(crate) fn beat_once(&self) -> usize {
        let held: Vec<_> = self
            .executing
            .iter()
            .filter(|entry| !entry.ownership_lost)
            .map(|entry| entry.execution.clone())
            .collect();

        let now = self.clock.now();
        let mut refreshed = 0;
        for execution in held {
            let key = execution.key();
            match self.store.update_heartbeat(&execution, now) {
                Ok(true) => {
                    refreshed += 1;
                    if let Some(mut entry) = self.executing.get_mut(&key) {
                        entry.confirmed_heartbeat = Some(now);
                    }
                }
                Ok(false) => {
                    warn!(
                        execution = %key,
                        version = execution.version,
                        "heartbeat matched no row, ownership lost"
                    );
                    if let Some(mut entry) = self.executing.get_mut(&key) {
                        entry.ownership_lost = true;
                    }
                }
                Err(e) => error!(execution = %key, error = %e, "failed to update heartbeat"),
            }
        }
        refreshed
    }
}
