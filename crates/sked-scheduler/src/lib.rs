//! `sked-scheduler` — cluster-safe task scheduling over a shared execution store.
//!
//! # Overview
//!
//! Any number of [`Scheduler`] instances may point at the same store. Each
//! one polls for due executions, claims them with a version-conditioned
//! `pick`, runs them on a bounded worker pool and writes the outcome back.
//! A heartbeat loop keeps claims alive; a dead execution detector hands
//! claims with stale heartbeats back to the pool.
//!
//! # Task kinds
//!
//! | Kind            | On success                                   |
//! |-----------------|----------------------------------------------|
//! | `OneTimeTask`   | Row removed                                  |
//! | `RecurringTask` | Rescheduled by its [`Schedule`]              |
//! | `CustomTask`    | Whatever [`CompletionOutcome`] the body returns |
//!
//! Failures and panics always become a retry with backoff.

pub mod backoff;
pub mod clock;
pub mod completion;
mod detector;
pub mod error;
pub mod executor;
mod heartbeat;
pub mod outcome;
pub mod poller;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod task;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{Applied, CompletionHandler};
pub use error::{Result, SchedulerError, TaskError};
pub use executor::CurrentlyExecuting;
pub use outcome::CompletionOutcome;
pub use poller::{PollReport, PollState};
pub use registry::TaskRegistry;
pub use schedule::Schedule;
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{
    CustomHandler, CustomTask, ExecutionContext, ExecutionHandler, OneTimeTask, RecurringTask, Task,
    RECURRING_INSTANCE_ID,
};
