use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sked_core::{CoreError, Execution, SchedulerConfig, SkedConfig, TaskInstance};
use sked_store::{ExecutionStore, Reschedule, ScheduledFilter, StoreError};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};
use crate::completion::CompletionHandler;
use crate::detector::DeadExecutionDetector;
use crate::error::{Result, SchedulerError};
use crate::executor::{CurrentlyExecuting, ExecutingMap, Executor};
use crate::heartbeat::Heartbeat;
use crate::poller::{PollReport, PollState, Poller};
use crate::registry::TaskRegistry;

/// Assembles a [`Scheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn ExecutionStore>,
    registry: TaskRegistry,
    config: SchedulerConfig,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn ExecutionStore>, registry: TaskRegistry) -> Self {
        Self {
            store,
            registry,
            config: SchedulerConfig::default(),
            backoff: BackoffPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Take scheduler and backoff settings from a loaded [`SkedConfig`].
    pub fn from_config(store: Arc<dyn ExecutionStore>, registry: TaskRegistry, config: &SkedConfig) -> Self {
        Self::new(store, registry)
            .config(config.scheduler.clone())
            .backoff(BackoffPolicy::from(&config.backoff))
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let threshold = chrono::Duration::from_std(self.config.dead_execution_threshold())
            .map_err(|_| CoreError::Config("dead execution threshold out of range".into()))?;

        let name = self.config.name.clone();
        let registry = Arc::new(self.registry);
        let executing: ExecutingMap = Arc::new(DashMap::new());
        let slots = Arc::new(Semaphore::new(self.config.worker_threads));
        let workers = Arc::new(Mutex::new(JoinSet::new()));
        let (state_tx, state_rx) = watch::channel(PollState::Idle);

        let executor = Arc::new(Executor {
            scheduler_name: name.clone(),
            registry: Arc::clone(&registry),
            completion: CompletionHandler::new(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                self.backoff,
            )
            .with_dead_threshold(threshold),
            clock: Arc::clone(&self.clock),
            executing: Arc::clone(&executing),
        });
        let poller = Arc::new(Poller {
            scheduler_name: name.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            batch_size: self.config.batch_size,
            slots: Arc::clone(&slots),
            executor,
            executing: Arc::clone(&executing),
            workers: Arc::clone(&workers),
            state: state_tx,
        });
        let heartbeat = Arc::new(Heartbeat {
            scheduler_name: name.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            executing: Arc::clone(&executing),
        });
        let detector = Arc::new(DeadExecutionDetector {
            scheduler_name: name,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            threshold,
        });

        Ok(Scheduler {
            config: self.config,
            store: self.store,
            clock: self.clock,
            registry,
            executing,
            slots,
            workers,
            trigger: Arc::new(Notify::new()),
            poller,
            heartbeat,
            detector,
            poll_state: state_rx,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    stop_polling: watch::Sender<bool>,
    stop_background: watch::Sender<bool>,
    poller: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

/// One scheduler instance: a poll/dispatch loop, a heartbeat loop, a dead
/// execution detector and a bounded worker pool over a shared store.
///
/// Instances never talk to each other; every cross-instance decision is a
/// conditional write in the store.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    executing: ExecutingMap,
    slots: Arc<Semaphore>,
    workers: Arc<Mutex<JoinSet<()>>>,
    trigger: Arc<Notify>,
    poller: Arc<Poller>,
    heartbeat: Arc<Heartbeat>,
    detector: Arc<DeadExecutionDetector>,
    poll_state: watch::Receiver<PollState>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn ExecutionStore>, registry: TaskRegistry) -> SchedulerBuilder {
        SchedulerBuilder::new(store, registry)
    }

    /// Identifier written to `picked_by`.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn poll_state(&self) -> PollState {
        *self.poll_state.borrow()
    }

    /// Insert startup executions, then spawn the background loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.insert_startup_executions()?;

        let (stop_polling, poll_rx) = watch::channel(false);
        let (stop_background, background_rx) = watch::channel(false);
        let poller = tokio::spawn(Arc::clone(&self.poller).run(
            self.config.polling_interval(),
            Arc::clone(&self.trigger),
            poll_rx,
        ));
        let background = vec![
            tokio::spawn(
                Arc::clone(&self.heartbeat).run(self.config.heartbeat_interval(), background_rx.clone()),
            ),
            tokio::spawn(
                Arc::clone(&self.detector)
                    .run(self.config.dead_execution_check_interval(), background_rx),
            ),
        ];

        info!(
            scheduler = %self.config.name,
            tasks = self.registry.len(),
            workers = self.config.worker_threads,
            polling_interval_ms = self.config.polling_interval_ms,
            "scheduler started"
        );
        *running = Some(Running {
            stop_polling,
            stop_background,
            poller,
            background,
        });
        Ok(())
    }

    /// Stop fetching, wait up to the shutdown grace period for in-flight
    /// executions, then abort whatever is still running.
    ///
    /// Aborted executions stay picked in the store and are recovered by a
    /// dead execution detector once their heartbeat goes stale.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.lock_running().take() else {
            return Err(SchedulerError::NotRunning);
        };
        info!(scheduler = %self.config.name, in_flight = self.executing.len(), "stopping scheduler");

        running.stop_polling.send_replace(true);
        if let Err(e) = running.poller.await {
            warn!(error = %e, "poller ended abnormally");
        }

        let grace = self.config.shutdown_grace_period();
        let all_slots = u32::try_from(self.config.worker_threads).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.slots.acquire_many(all_slots)).await {
            Ok(_) => debug!("all workers finished"),
            Err(_) => {
                warn!(
                    scheduler = %self.config.name,
                    still_running = self.executing.len(),
                    grace_ms = self.config.shutdown_grace_period_ms,
                    "shutdown grace period elapsed, aborting workers"
                );
                self.workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .abort_all();
            }
        }

        running.stop_background.send_replace(true);
        for handle in running.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        self.executing.clear();
        info!(scheduler = %self.config.name, "scheduler stopped");
        Ok(())
    }

    /// Add a new execution. Returns `false` when the instance already exists.
    pub fn schedule(&self, instance: TaskInstance, when: DateTime<Utc>) -> Result<bool> {
        if !self.registry.contains(&instance.task_name) {
            return Err(SchedulerError::UnknownTask(instance.task_name));
        }
        let created = self
            .store
            .create_if_not_exists(&Execution::new(instance, when))?;
        if created {
            self.trigger_if_due(when);
        }
        Ok(created)
    }

    /// Move an unpicked execution to `when`, optionally replacing its data.
    pub fn reschedule(
        &self,
        instance: &TaskInstance,
        when: DateTime<Utc>,
        new_data: Option<Vec<u8>>,
    ) -> Result<()> {
        let current = self.unpicked(instance)?;
        let update = Reschedule::keep_state(&current, when).with_data(new_data);
        self.store
            .reschedule(&current, &update)
            .map_err(|e| self.explain_admin_failure(instance, e))?;
        self.trigger_if_due(when);
        Ok(())
    }

    /// Delete an unpicked execution.
    pub fn cancel(&self, instance: &TaskInstance) -> Result<()> {
        let current = self.unpicked(instance)?;
        self.store
            .remove(&current)
            .map_err(|e| self.explain_admin_failure(instance, e))?;
        info!(execution = %instance.key(), "execution cancelled");
        Ok(())
    }

    pub fn trigger_immediate_check(&self) {
        self.trigger.notify_one();
    }

    /// Run one poll cycle now, outside the timer. Needs a Tokio runtime.
    pub fn check_for_due_executions(&self) -> Result<PollReport> {
        self.poller.poll_once()
    }

    /// Run one dead execution sweep now, outside the timer.
    pub fn detect_dead_executions(&self) -> Result<usize> {
        self.detector.sweep_once()
    }

    /// Refresh heartbeats for everything this instance holds, outside the timer.
    pub fn update_heartbeats(&self) -> usize {
        self.heartbeat.beat_once()
    }

    pub fn get_execution(&self, instance: &TaskInstance) -> Result<Option<Execution>> {
        Ok(self.store.get_execution(&instance.task_name, &instance.id)?)
    }

    pub fn scheduled_executions(&self, filter: &ScheduledFilter) -> Result<Vec<Execution>> {
        Ok(self.store.get_scheduled_executions(filter)?)
    }

    /// Executions that have kept failing, without a success, for at least `period`.
    pub fn executions_failing_longer_than(&self, period: Duration) -> Result<Vec<Execution>> {
        let period = chrono::Duration::from_std(period)
            .map_err(|_| CoreError::Config("failure period out of range".into()))?;
        Ok(self
            .store
            .get_executions_failing_longer_than(self.clock.now() - period)?)
    }

    /// Executions held by this instance, oldest pick first.
    pub fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        let mut held: Vec<_> = self.executing.iter().map(|e| e.value().clone()).collect();
        held.sort_by(|a, b| a.picked_at.cmp(&b.picked_at));
        held
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_startup_executions(&self) -> Result<()> {
        let now = self.clock.now();
        for task in self.registry.tasks() {
            for startup in task.startup_executions(now) {
                let key = startup.instance.key();
                if self.store.create_if_not_exists(&startup.into_execution())? {
                    info!(execution = %key, "created startup execution");
                } else {
                    debug!(execution = %key, "startup execution already present");
                }
            }
        }
        Ok(())
    }

    fn trigger_if_due(&self, when: DateTime<Utc>) {
        if self.config.immediate_execution && when <= self.clock.now() {
            self.trigger.notify_one();
        }
    }

    fn unpicked(&self, instance: &TaskInstance) -> Result<Execution> {
        match self.store.get_execution(&instance.task_name, &instance.id)? {
            None => Err(SchedulerError::ExecutionNotFound(instance.key())),
            Some(e) if e.picked => Err(SchedulerError::ExecutionRunning(instance.key())),
            Some(e) => Ok(e),
        }
    }

    /// An admin write that raced a pick or a delete reports what happened
    /// instead of a consistency violation.
    fn explain_admin_failure(&self, instance: &TaskInstance, err: StoreError) -> SchedulerError {
        if !matches!(err, StoreError::ConsistencyViolation { affected: 0, .. }) {
            return err.into();
        }
        match self.store.get_execution(&instance.task_name, &instance.id) {
            Ok(None) => SchedulerError::ExecutionNotFound(instance.key()),
            Ok(Some(e)) if e.picked => SchedulerError::ExecutionRunning(instance.key()),
            _ => err.into(),
        }
    }
}
