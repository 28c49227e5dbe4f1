//! Task behaviour and the three built-in task kinds.
//!
//! A [`Task`] turns a picked execution into a [`CompletionOutcome`]. Errors
//! returned from `execute` (and panics) are turned into
//! [`CompletionOutcome::RetryWithBackoff`] by the executor, so task bodies
//! only decide what happens on success.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sked_core::{Execution, SchedulableInstance, TaskInstance};

use crate::error::{Result, TaskError};
use crate::outcome::CompletionOutcome;
use crate::schedule::Schedule;

/// Instance id used by [`RecurringTask`] for its single execution row.
pub const RECURRING_INSTANCE_ID: &str = "recurring";

/// What a running task can see about its execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution: Execution,
    pub scheduler_name: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError>;

    /// Executions inserted (if absent) when a scheduler starts.
    fn startup_executions(&self, _now: DateTime<Utc>) -> Vec<SchedulableInstance> {
        Vec::new()
    }
}

/// Body of a one-time or recurring task.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn run(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<(), TaskError>;
}

#[async_trait]
impl<F, Fut> ExecutionHandler for F
where
    F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
{
    async fn run(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<(), TaskError> {
        (self)(instance.clone(), ctx.clone()).await
    }
}

/// Body of a [`CustomTask`]; decides the outcome itself.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    async fn run(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError>;
}

#[async_trait]
impl<F, Fut> CustomHandler for F
where
    F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<CompletionOutcome, TaskError>> + Send + 'static,
{
    async fn run(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError> {
        (self)(instance.clone(), ctx.clone()).await
    }
}

/// Runs once per instance; the row is removed on success.
pub struct OneTimeTask<H> {
    name: String,
    handler: H,
}

impl<H: ExecutionHandler> OneTimeTask<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn instance(&self, id: impl Into<String>) -> TaskInstance {
        TaskInstance::new(self.name.clone(), id)
    }
}

#[async_trait]
impl<H: ExecutionHandler> Task for OneTimeTask<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError> {
        self.handler.run(instance, ctx).await?;
        Ok(CompletionOutcome::Remove)
    }
}

/// Single-instance task that reschedules itself by its [`Schedule`].
///
/// Every scheduler that registers it inserts the execution on startup if it
/// is absent, so exactly one row exists cluster-wide.
pub struct RecurringTask<H> {
    name: String,
    schedule: Schedule,
    initial_data: Option<Vec<u8>>,
    handler: H,
}

impl<H: ExecutionHandler> RecurringTask<H> {
    pub fn new(name: impl Into<String>, schedule: Schedule, handler: H) -> Result<Self> {
        schedule.validate()?;
        Ok(Self {
            name: name.into(),
            schedule,
            initial_data: None,
            handler,
        })
    }

    pub fn with_initial_data(mut self, data: Vec<u8>) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

#[async_trait]
impl<H: ExecutionHandler> Task for RecurringTask<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError> {
        self.handler.run(instance, ctx).await?;
        let next_time = self
            .schedule
            .next_execution(ctx.started_at)
            .ok_or_else(|| TaskError::failed(format!("{:?} has no next execution", self.schedule)))?;
        Ok(CompletionOutcome::reschedule(next_time))
    }

    fn startup_executions(&self, now: DateTime<Utc>) -> Vec<SchedulableInstance> {
        let Some(first) = self.schedule.initial_execution(now) else {
            return Vec::new();
        };
        let mut instance = TaskInstance::new(self.name.clone(), RECURRING_INSTANCE_ID);
        instance.data = self.initial_data.clone();
        vec![SchedulableInstance::new(instance, first)]
    }
}

/// Task whose handler returns the [`CompletionOutcome`] directly, e.g. to
/// chain into another task.
pub struct CustomTask<H> {
    name: String,
    handler: H,
    startup: Vec<SchedulableInstance>,
}

impl<H: CustomHandler> CustomTask<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
            startup: Vec::new(),
        }
    }

    /// Insert `instance` (if absent) whenever a scheduler starts.
    pub fn with_startup_execution(mut self, instance: SchedulableInstance) -> Self {
        self.startup.push(instance);
        self
    }
}

#[async_trait]
impl<H: CustomHandler> Task for CustomTask<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        instance: &TaskInstance,
        ctx: &ExecutionContext,
    ) -> std::result::Result<CompletionOutcome, TaskError> {
        self.handler.run(instance, ctx).await
    }

    fn startup_executions(&self, _now: DateTime<Utc>) -> Vec<SchedulableInstance> {
        self.startup.clone()
    }
}
