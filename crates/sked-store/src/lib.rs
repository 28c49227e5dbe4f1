//! `sked-store` — the persistence boundary of the scheduler.
//!
//! Every write is a single conditional statement keyed by
//! `(task_name, task_instance, version)` and reports how many rows it
//! touched, so callers never need a read-modify-write transaction.
//!
//! | Operation              | Zero rows means            | More than one row |
//! |------------------------|----------------------------|-------------------|
//! | `create_if_not_exists` | n/a (duplicate key → false) | n/a              |
//! | `pick`                 | lost the race → `None`     | fatal             |
//! | `update_heartbeat`     | ownership lost → `false`   | fatal             |
//! | `release_dead`         | already recovered → `false`| fatal             |
//! | `reschedule`/`remove`  | fatal (caller owns the row)| fatal             |

pub mod db;
pub mod error;
pub mod query;
pub mod repository;
pub mod runner;
pub mod store;

pub use error::{Mutation, Result, StoreError};
pub use query::{Condition, QuerySpec, SqlParam};
pub use repository::SqlExecutionStore;
pub use runner::{SqlRunner, SqliteRunner};
pub use store::{ExecutionStore, Reschedule, ScheduledFilter};
