use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sked_store::ExecutionStore;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use crate::clock::Clock;
use crate::error::Result;
use crate::executor::{CurrentlyExecuting, ExecutingMap, Executor};

/// Where the poll/dispatch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    FetchingDue,
    Locking,
    Dispatching,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub picked: usize,
    pub lost_races: usize,
    /// The fetch came back full and every candidate was claimed, so more
    /// work is probably waiting.
    pub batch_exhausted: bool,
}

pub(crate) struct Poller {
    pub(crate) scheduler_name: String,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) batch_size: u32,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) executing: ExecutingMap,
    pub(crate) workers: Arc<Mutex<JoinSet<()>>>,
    pub(crate) state: watch::Sender<PollState>,
}

impl Poller {
    /// Poll on `interval` and whenever `trigger` fires, until `shutdown`
    /// broadcasts `true`.
    pub(crate) async fn run(
        self: Arc<Self>,
        interval: Duration,
        trigger: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(scheduler = %self.scheduler_name, "poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => trace!("immediate check triggered"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once() {
                Ok(report) if report.batch_exhausted => trigger.notify_one(),
                Ok(_) => {}
                Err(e) => error!(scheduler = %self.scheduler_name, error = %e, "poll cycle failed"),
            }
        }
        self.state.send_replace(PollState::Idle);
        debug!(scheduler = %self.scheduler_name, "poller stopped");
    }

    /// One fetch → lock → dispatch cycle.
    ///
    /// A candidate is only picked once a worker slot is reserved for it, so
    /// a saturated pool ends the cycle early and never leaves a picked
    /// execution without a worker.
    pub(crate) fn poll_once(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let capacity = self.slots.available_permits();
        if capacity == 0 {
            trace!("worker pool saturated, skipping poll");
            return Ok(report);
        }
        let limit = self
            .batch_size
            .min(u32::try_from(capacity).unwrap_or(u32::MAX));

        self.state.send_replace(PollState::FetchingDue);
        let now = self.clock.now();
        let due = self.store.lock_and_fetch_due(now, limit);
        let due = match due {
            Ok(due) => due,
            Err(e) => {
                self.state.send_replace(PollState::Idle);
                return Err(e.into());
            }
        };
        report.fetched = due.len();

        self.state.send_replace(PollState::Locking);
        for candidate in due {
            let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!("worker pool saturated, leaving remaining candidates for the next cycle");
                break;
            };

            let picked = match self.store.pick(&candidate, &self.scheduler_name, self.clock.now()) {
                Ok(Some(picked)) => picked,
                Ok(None) => {
                    report.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    self.state.send_replace(PollState::Idle);
                    return Err(e.into());
                }
            };
            report.picked += 1;

            self.state.send_replace(PollState::Dispatching);
            self.executing.insert(
                picked.key(),
                CurrentlyExecuting {
                    execution: picked.clone(),
                    picked_at: self.clock.now(),
                    task_resolved: true,
                    ownership_lost: false,
                    confirmed_heartbeat: picked.last_heartbeat,
                },
            );
            let executor = Arc::clone(&self.executor);
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            while workers.try_join_next().is_some() {}
            workers.spawn(async move {
                let _slot = slot;
                executor.run(picked).await;
            });
            drop(workers);
            self.state.send_replace(PollState::Locking);
        }

        report.batch_exhausted = report.fetched == limit as usize
            && report.picked == report.fetched
            && report.fetched > 0;
        self.state.send_replace(PollState::Idle);
        if report.fetched > 0 {
            debug!(
                scheduler = %self.scheduler_name,
                fetched = report.fetched,
                picked = report.picked,
                lost_races = report.lost_races,
                "poll cycle done"
            );
        }
        Ok(report)
    }
}
