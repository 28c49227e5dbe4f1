//! `sked-core` — data model and configuration shared by the store, the
//! scheduler and the daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackoffConfig, BackoffKind, DatabaseConfig, SchedulerConfig, SkedConfig};
pub use error::{CoreError, Result};
pub use types::{Execution, ExecutionKey, SchedulableInstance, TaskInstance};
