//! Demo tasks wired into the daemon: a two-step job chain and a recurring
//! stats report.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sked_core::{SchedulableInstance, TaskInstance};
use sked_scheduler::{
    CompletionOutcome, CustomTask, ExecutionContext, OneTimeTask, RecurringTask, Schedule,
    Scheduler, TaskError, TaskRegistry,
};
use sked_store::{ExecutionStore, ScheduledFilter};
use tracing::info;

pub const STEP_ONE: &str = "job-step-1";
pub const STEP_TWO: &str = "job-step-2";
pub const STATS_REPORT: &str = "stats-report";

/// Payload carried from one job step to the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobId {
    pub id: u64,
}

pub fn registry(store: Arc<dyn ExecutionStore>) -> anyhow::Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();

    registry.register(CustomTask::new(
        STEP_ONE,
        |instance: TaskInstance, ctx: ExecutionContext| async move {
            let job: Option<JobId> = instance.json()?;
            info!(instance = %instance, job = ?job, scheduler = %ctx.scheduler_name, "step 1 done, chaining");
            let next = TaskInstance {
                task_name: STEP_TWO.to_string(),
                ..instance
            };
            Ok::<_, TaskError>(CompletionOutcome::chain(SchedulableInstance::new(next, Utc::now())))
        },
    ))?;

    registry.register(OneTimeTask::new(
        STEP_TWO,
        |instance: TaskInstance, ctx: ExecutionContext| async move {
            let job: JobId = instance
                .json()?
                .ok_or_else(|| TaskError::failed("job-step-2 needs a job id"))?;
            info!(job_id = job.id, scheduler = %ctx.scheduler_name, "step 2 done, job finished");
            Ok::<_, TaskError>(())
        },
    ))?;

    registry.register(RecurringTask::new(
        STATS_REPORT,
        Schedule::fixed_delay(Duration::from_secs(60)),
        move |_instance: TaskInstance, _ctx: ExecutionContext| {
            let store = Arc::clone(&store);
            async move {
                let scheduled = store
                    .get_scheduled_executions(&ScheduledFilter::all())
                    .map_err(|e| TaskError::Other(Box::new(e)))?;
                let picked = scheduled.iter().filter(|e| e.picked).count();
                info!(scheduled = scheduled.len(), picked, "execution stats");
                Ok::<_, TaskError>(())
            }
        },
    )?)?;

    Ok(registry)
}

/// Queue the job-507 chain unless it is already in flight.
pub fn seed(scheduler: &Scheduler) -> anyhow::Result<()> {
    let first = TaskInstance::new(STEP_ONE, "job-507").with_json(&JobId { id: 507 })?;
    if scheduler.schedule(first, Utc::now())? {
        info!("queued demo job job-507");
    }
    Ok(())
}
