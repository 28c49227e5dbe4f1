use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sked_core::{config::DEFAULT_TABLE, CoreError, SchedulableInstance, SchedulerConfig, TaskInstance};
use sked_scheduler::{
    BackoffPolicy, CompletionOutcome, CustomTask, ExecutionContext, OneTimeTask, RecurringTask,
    Schedule, Scheduler, SchedulerError, TaskError, TaskRegistry, RECURRING_INSTANCE_ID,
};
use sked_store::{ExecutionStore, ScheduledFilter, SqlExecutionStore, SqliteRunner, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JobId {
    id: u64,
}

type Runs = Arc<Mutex<HashMap<String, usize>>>;

fn open_store(path: &Path) -> Arc<dyn ExecutionStore> {
    let runner = SqliteRunner::open(path).unwrap();
    runner.init_schema(DEFAULT_TABLE).unwrap();
    Arc::new(SqlExecutionStore::new(runner))
}

fn fast_config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        name: name.into(),
        polling_interval_ms: 20,
        batch_size: 30,
        worker_threads: 4,
        heartbeat_interval_ms: 50,
        dead_execution_multiplier: 4,
        dead_execution_check_interval_ms: Some(50),
        shutdown_grace_period_ms: 2_000,
        immediate_execution: true,
    }
}

fn counting_task(name: &str, runs: &Runs) -> OneTimeTask<impl sked_scheduler::ExecutionHandler> {
    let runs = Arc::clone(runs);
    OneTimeTask::new(name, move |instance: TaskInstance, _ctx: ExecutionContext| {
        let runs = Arc::clone(&runs);
        async move {
            *runs.lock().unwrap().entry(instance.id).or_default() += 1;
            Ok::<_, TaskError>(())
        }
    })
}

fn row_count(store: &Arc<dyn ExecutionStore>) -> usize {
    store
        .get_scheduled_executions(&ScheduledFilter::all())
        .unwrap()
        .len()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_instances_run_each_execution_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sked.db");
    let runs: Runs = Arc::default();

    let mut schedulers = Vec::new();
    for name in ["node-a", "node-b"] {
        let registry = TaskRegistry::new().with(counting_task("greet", &runs)).unwrap();
        let scheduler = Scheduler::builder(open_store(&path), registry)
            .config(fast_config(name))
            .build()
            .unwrap();
        schedulers.push(scheduler);
    }

    let now = Utc::now();
    for i in 0..40 {
        schedulers[i % 2]
            .schedule(TaskInstance::new("greet", format!("job-{i}")), now)
            .unwrap();
    }
    for scheduler in &schedulers {
        scheduler.start().unwrap();
    }

    let observer = open_store(&path);
    eventually("all executions to finish", || row_count(&observer) == 0).await;
    for scheduler in &schedulers {
        scheduler.stop().await.unwrap();
    }

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 40);
    assert!(runs.values().all(|&n| n == 1), "some execution ran twice: {runs:?}");
}

#[tokio::test]
async fn chained_task_carries_its_data_to_the_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let seen: Arc<Mutex<Vec<JobId>>> = Arc::default();

    let step_one = CustomTask::new("job-step-1", |instance: TaskInstance, _ctx: ExecutionContext| async move {
        let next = TaskInstance {
            task_name: "job-step-2".into(),
            ..instance
        };
        Ok::<_, TaskError>(CompletionOutcome::chain(SchedulableInstance::new(next, Utc::now())))
    });
    let recorded = Arc::clone(&seen);
    let step_two = OneTimeTask::new("job-step-2", move |instance: TaskInstance, _ctx: ExecutionContext| {
        let recorded = Arc::clone(&recorded);
        async move {
            let job: JobId = instance.json()?.ok_or_else(|| TaskError::failed("missing job data"))?;
            recorded.lock().unwrap().push(job);
            Ok::<_, TaskError>(())
        }
    });
    let registry = TaskRegistry::new().with(step_one).unwrap().with(step_two).unwrap();
    let scheduler = Scheduler::builder(Arc::clone(&store), registry)
        .config(fast_config("node-a"))
        .build()
        .unwrap();

    let first = TaskInstance::new("job-step-1", "job-507")
        .with_json(&JobId { id: 507 })
        .unwrap();
    assert!(scheduler.schedule(first, Utc::now()).unwrap());
    scheduler.start().unwrap();

    eventually("the second step to run", || !seen.lock().unwrap().is_empty()).await;
    eventually("the chain to drain", || row_count(&store) == 0).await;
    scheduler.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![JobId { id: 507 }]);
}

#[tokio::test]
async fn recurring_startup_insert_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sked.db");
    let runs: Runs = Arc::default();

    for name in ["node-a", "node-b"] {
        let task_runs = Arc::clone(&runs);
        let task = RecurringTask::new(
            "cleanup",
            Schedule::fixed_delay(Duration::from_secs(3600)),
            move |instance: TaskInstance, _ctx: ExecutionContext| {
                let runs = Arc::clone(&task_runs);
                async move {
                    *runs.lock().unwrap().entry(instance.id).or_default() += 1;
                    Ok::<_, TaskError>(())
                }
            },
        )
        .unwrap();
        let scheduler = Scheduler::builder(open_store(&path), TaskRegistry::new().with(task).unwrap())
            .config(fast_config(name))
            .build()
            .unwrap();
        scheduler.start().unwrap();
        eventually("the first run", || !runs.lock().unwrap().is_empty()).await;
        scheduler.stop().await.unwrap();
    }

    let store = open_store(&path);
    let rows = store.get_scheduled_executions(&ScheduledFilter::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instance_id(), RECURRING_INSTANCE_ID);
    assert!(!rows[0].picked);
    assert!(rows[0].execution_time > Utc::now() + chrono::Duration::minutes(59));
    assert_eq!(runs.lock().unwrap()[RECURRING_INSTANCE_ID], 1);
}

#[tokio::test]
async fn failing_execution_is_retried_later() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let task = OneTimeTask::new("flaky", |_i: TaskInstance, _c: ExecutionContext| async {
        Err::<(), _>(TaskError::failed("downstream unavailable"))
    });
    let scheduler = Scheduler::builder(Arc::clone(&store), TaskRegistry::new().with(task).unwrap())
        .config(fast_config("node-a"))
        .backoff(BackoffPolicy::fixed(Duration::from_secs(3600)))
        .build()
        .unwrap();

    scheduler.schedule(TaskInstance::new("flaky", "a"), Utc::now()).unwrap();
    scheduler.start().unwrap();
    eventually("the failure to be recorded", || {
        store
            .get_execution("flaky", "a")
            .unwrap()
            .is_some_and(|e| e.consecutive_failures == 1 && !e.picked)
    })
    .await;
    scheduler.stop().await.unwrap();

    let row = store.get_execution("flaky", "a").unwrap().unwrap();
    assert!(row.last_failure.is_some());
    assert_eq!(row.last_success, None);
    assert!(row.execution_time > Utc::now() + chrono::Duration::minutes(59));

    let failing = scheduler
        .executions_failing_longer_than(Duration::ZERO)
        .unwrap();
    assert_eq!(failing.len(), 1);
}

#[tokio::test]
async fn admin_operations_respect_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let runs: Runs = Arc::default();
    let scheduler = Scheduler::builder(
        Arc::clone(&store),
        TaskRegistry::new().with(counting_task("greet", &runs)).unwrap(),
    )
    .config(fast_config("node-a"))
    .build()
    .unwrap();

    let unknown = scheduler.schedule(TaskInstance::new("nobody-home", "a"), Utc::now());
    assert!(matches!(unknown, Err(SchedulerError::UnknownTask(name)) if name == "nobody-home"));

    let later = Utc::now() + chrono::Duration::hours(2);
    let instance = TaskInstance::new("greet", "a");
    assert!(scheduler.schedule(instance.clone(), later).unwrap());
    assert!(!scheduler.schedule(instance.clone(), Utc::now()).unwrap());

    let moved = later + chrono::Duration::hours(1);
    scheduler
        .reschedule(&instance, moved, Some(b"v2".to_vec()))
        .unwrap();
    let row = scheduler.get_execution(&instance).unwrap().unwrap();
    assert_eq!(row.execution_time.timestamp_micros(), moved.timestamp_micros());
    assert_eq!(row.task_instance.data.as_deref(), Some(&b"v2"[..]));

    store.pick(&row, "node-b", Utc::now()).unwrap().unwrap();
    assert!(matches!(
        scheduler.cancel(&instance),
        Err(SchedulerError::ExecutionRunning(_))
    ));
    assert!(matches!(
        scheduler.reschedule(&instance, later, None),
        Err(SchedulerError::ExecutionRunning(_))
    ));

    let other = TaskInstance::new("greet", "b");
    scheduler.schedule(other.clone(), later).unwrap();
    scheduler.cancel(&other).unwrap();
    assert!(matches!(
        scheduler.cancel(&other),
        Err(SchedulerError::ExecutionNotFound(_))
    ));
    assert!(runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dead_execution_is_recovered_and_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let runs: Runs = Arc::default();

    let now = Utc::now();
    store
        .create_if_not_exists(&sked_core::Execution::new(TaskInstance::new("greet", "orphan"), now))
        .unwrap();
    let fresh = store.get_execution("greet", "orphan").unwrap().unwrap();
    store.pick(&fresh, "node-crashed", now).unwrap().unwrap();

    let scheduler = Scheduler::builder(
        Arc::clone(&store),
        TaskRegistry::new().with(counting_task("greet", &runs)).unwrap(),
    )
    .config(fast_config("node-b"))
    .build()
    .unwrap();
    scheduler.start().unwrap();

    eventually("the orphan to be recovered and run", || row_count(&store) == 0).await;
    scheduler.stop().await.unwrap();
    assert_eq!(runs.lock().unwrap()["orphan"], 1);
}

#[tokio::test]
async fn stop_waits_for_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let task = OneTimeTask::new("slow", |_i: TaskInstance, _c: ExecutionContext| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, TaskError>(())
    });
    let scheduler = Scheduler::builder(Arc::clone(&store), TaskRegistry::new().with(task).unwrap())
        .config(fast_config("node-a"))
        .build()
        .unwrap();

    assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    scheduler.schedule(TaskInstance::new("slow", "a"), Utc::now()).unwrap();
    scheduler.start().unwrap();
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));

    eventually("the slow task to be picked", || !scheduler.currently_executing().is_empty()).await;
    scheduler.stop().await.unwrap();

    assert!(!scheduler.is_running());
    assert!(scheduler.currently_executing().is_empty());
    assert!(store.get_execution("slow", "a").unwrap().is_none());
}

#[tokio::test]
async fn stop_abandons_work_past_the_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let task = OneTimeTask::new("stuck", |_i: TaskInstance, _c: ExecutionContext| async {
        std::future::pending::<()>().await;
        Ok::<_, TaskError>(())
    });
    let config = SchedulerConfig {
        shutdown_grace_period_ms: 50,
        ..fast_config("node-a")
    };
    let scheduler = Scheduler::builder(Arc::clone(&store), TaskRegistry::new().with(task).unwrap())
        .config(config)
        .build()
        .unwrap();

    scheduler.schedule(TaskInstance::new("stuck", "a"), Utc::now()).unwrap();
    scheduler.start().unwrap();
    eventually("the stuck task to be picked", || !scheduler.currently_executing().is_empty()).await;
    scheduler.stop().await.unwrap();

    let row = store.get_execution("stuck", "a").unwrap().unwrap();
    assert!(row.picked);
    assert_eq!(row.picked_by.as_deref(), Some("node-a"));
    assert!(scheduler.currently_executing().is_empty());
}

fn hourly_poll_config(name: &str, immediate_execution: bool) -> SchedulerConfig {
    SchedulerConfig {
        polling_interval_ms: 3_600_000,
        immediate_execution,
        ..fast_config(name)
    }
}

#[tokio::test]
async fn immediate_execution_runs_due_work_between_polls() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let runs: Runs = Arc::default();
    let scheduler = Scheduler::builder(
        Arc::clone(&store),
        TaskRegistry::new().with(counting_task("greet", &runs)).unwrap(),
    )
    .config(hourly_poll_config("node-a", true))
    .build()
    .unwrap();

    scheduler.start().unwrap();
    // let the startup poll find nothing
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.schedule(TaskInstance::new("greet", "now"), Utc::now()).unwrap());

    tokio::time::timeout(
        Duration::from_secs(1),
        eventually("the due execution to run", || runs.lock().unwrap().contains_key("now")),
    )
    .await
    .expect("due execution waited for the next poll");
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn without_immediate_execution_due_work_waits_for_a_poll() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let runs: Runs = Arc::default();
    let scheduler = Scheduler::builder(
        Arc::clone(&store),
        TaskRegistry::new().with(counting_task("greet", &runs)).unwrap(),
    )
    .config(hourly_poll_config("node-a", false))
    .build()
    .unwrap();

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.schedule(TaskInstance::new("greet", "now"), Utc::now()).unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(runs.lock().unwrap().is_empty());
    assert_eq!(row_count(&store), 1);

    scheduler.trigger_immediate_check();
    tokio::time::timeout(
        Duration::from_secs(1),
        eventually("the triggered poll to run it", || runs.lock().unwrap().contains_key("now")),
    )
    .await
    .expect("trigger_immediate_check did not wake the poller");
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn unstorable_times_are_refused_and_leave_polling_intact() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let runs: Runs = Arc::default();
    let scheduler = Scheduler::builder(
        Arc::clone(&store),
        TaskRegistry::new().with(counting_task("greet", &runs)).unwrap(),
    )
    .config(fast_config("node-a"))
    .build()
    .unwrap();

    let far = chrono::DateTime::<Utc>::MAX_UTC;
    let err = scheduler
        .schedule(TaskInstance::new("greet", "never"), far)
        .unwrap_err();
    assert!(
        matches!(&err, SchedulerError::Store(StoreError::InsertFailed { source })
            if matches!(**source, StoreError::InstantOutOfRange(_))),
        "got {err:?}"
    );

    let later = TaskInstance::new("greet", "later");
    scheduler
        .schedule(later.clone(), Utc::now() + chrono::Duration::hours(1))
        .unwrap();
    let err = scheduler.reschedule(&later, far, None).unwrap_err();
    assert!(
        matches!(err, SchedulerError::Store(StoreError::InstantOutOfRange(_))),
        "got {err:?}"
    );

    scheduler.reschedule(&later, Utc::now(), None).unwrap();
    scheduler.start().unwrap();
    eventually("the due execution to run", || runs.lock().unwrap().contains_key("later")).await;
    scheduler.stop().await.unwrap();
}

#[test]
fn builder_rejects_dead_threshold_beyond_timestamp_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("sked.db"));
    let config = SchedulerConfig {
        heartbeat_interval_ms: u64::MAX,
        dead_execution_multiplier: u32::MAX,
        ..fast_config("node-a")
    };
    let err = Scheduler::builder(Arc::clone(&store), TaskRegistry::new())
        .config(config.clone())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::Core(CoreError::Config(_))), "got {err:?}");

    let representable_but_huge = SchedulerConfig {
        dead_execution_multiplier: 4,
        ..config
    };
    let err = Scheduler::builder(store, TaskRegistry::new())
        .config(representable_but_huge)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::Core(CoreError::Config(_))), "got {err:?}");
}
