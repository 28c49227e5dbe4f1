use chrono::{DateTime, Utc};
use sked_core::{config::DEFAULT_TABLE, Execution};
use tracing::{debug, error, instrument, trace};

use crate::db::validate_table_name;
use crate::error::{Mutation, Result, StoreError};
use crate::query::{Condition, QuerySpec, SqlParam};
use crate::runner::SqlRunner;
use crate::store::{ExecutionStore, Reschedule, ScheduledFilter};

const DUE_ORDER: &str = "execution_time asc, task_name asc, task_instance asc";

/// [`ExecutionStore`] that renders one parameterised statement per operation
/// and hands it to a [`SqlRunner`].
pub struct SqlExecutionStore<R> {
    runner: R,
    table: String,
    row_locking: bool,
}

impl<R: SqlRunner> SqlExecutionStore<R> {
    /// Use the default `scheduled_tasks` table.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            table: DEFAULT_TABLE.to_string(),
            row_locking: false,
        }
    }

    pub fn with_table(runner: R, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            runner,
            table,
            row_locking: false,
        })
    }

    /// Append `for update skip locked` to the due fetch.
    pub fn with_row_locking(mut self, enabled: bool) -> Self {
        self.row_locking = enabled;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Base `select * from <table>` for composing ad hoc scans.
    pub fn select_from_table(&self) -> QuerySpec {
        QuerySpec::select_from(&self.table)
    }

    pub fn select_executions(&self, query: &QuerySpec) -> Result<Vec<Execution>> {
        self.runner.query(&query.render(), &query.params())
    }

    fn key_params(execution: &Execution) -> [SqlParam; 3] {
        [
            SqlParam::text(execution.task_name()),
            SqlParam::text(execution.instance_id()),
            SqlParam::Int(execution.version),
        ]
    }

    /// Require that an ownership-guarded write touched exactly one row.
    fn expect_one(&self, execution: &Execution, operation: Mutation, affected: usize) -> Result<()> {
        if affected == 1 {
            return Ok(());
        }
        error!(
            task_name = execution.task_name(),
            instance = execution.instance_id(),
            version = execution.version,
            %operation,
            affected,
            "ownership-guarded write did not touch exactly one row"
        );
        Err(StoreError::ConsistencyViolation { operation, affected })
    }

    fn insert(&self, execution: &Execution) -> Result<()> {
        let sql = format!(
            "insert into {}(task_name, task_instance, task_data, execution_time, picked, version) values(?, ?, ?, ?, ?, ?)",
            self.table
        );
        let data = execution
            .task_instance
            .data
            .clone()
            .map(SqlParam::Blob)
            .unwrap_or(SqlParam::Null);
        self.runner.execute(
            &sql,
            &[
                SqlParam::text(execution.task_name()),
                SqlParam::text(execution.instance_id()),
                data,
                SqlParam::Timestamp(execution.execution_time),
                SqlParam::Bool(false),
                SqlParam::Int(1),
            ],
        )?;
        Ok(())
    }
}

impl<R: SqlRunner> ExecutionStore for SqlExecutionStore<R> {
    #[instrument(skip(self, execution), fields(execution = %execution.key()))]
    fn create_if_not_exists(&self, execution: &Execution) -> Result<bool> {
        if self
            .get_execution(execution.task_name(), execution.instance_id())?
            .is_some()
        {
            debug!("execution already exists, not creating");
            return Ok(false);
        }

        match self.insert(execution) {
            Ok(()) => Ok(true),
            Err(StoreError::DuplicateKey(_)) => {
                debug!("execution inserted concurrently, not creating");
                Ok(false)
            }
            Err(e) => Err(StoreError::InsertFailed {
                source: Box::new(e),
            }),
        }
    }

    fn get_execution(&self, task_name: &str, instance_id: &str) -> Result<Option<Execution>> {
        let query = self
            .select_from_table()
            .and_where(Condition::eq("task_name", SqlParam::text(task_name)))
            .and_where(Condition::eq("task_instance", SqlParam::text(instance_id)));

        let mut rows = self.select_executions(&query)?;
        if rows.len() > 1 {
            return Err(StoreError::MultipleExecutions {
                task_name: task_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        Ok(rows.pop())
    }

    #[instrument(skip(self))]
    fn lock_and_fetch_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Execution>> {
        let query = self
            .select_from_table()
            .and_where(Condition::eq("picked", SqlParam::Bool(false)))
            .and_where(Condition::at_most("execution_time", SqlParam::Timestamp(now)))
            .order_by(DUE_ORDER)
            .limit(limit)
            .skip_locked(self.row_locking);
        self.select_executions(&query)
    }

    #[instrument(skip(self, execution), fields(execution = %execution.key(), version = execution.version))]
    fn pick(
        &self,
        execution: &Execution,
        picked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>> {
        let sql = format!(
            "update {} set picked = ?, picked_by = ?, last_heartbeat = ?, version = version + 1 \
             where picked = ? and task_name = ? and task_instance = ? and version = ?",
            self.table
        );
        let [name, id, version] = Self::key_params(execution);
        let affected = self.runner.execute(
            &sql,
            &[
                SqlParam::Bool(true),
                SqlParam::text(picked_by),
                SqlParam::Timestamp(now),
                SqlParam::Bool(false),
                name,
                id,
                version,
            ],
        )?;

        match affected {
            0 => {
                trace!("lost race picking execution");
                Ok(None)
            }
            1 => {
                let picked = self
                    .get_execution(execution.task_name(), execution.instance_id())?
                    .ok_or_else(|| {
                        StoreError::Inconsistent(format!(
                            "execution {} vanished right after being picked",
                            execution.key()
                        ))
                    })?;
                let owned = picked.picked
                    && picked.picked_by.as_deref() == Some(picked_by)
                    && picked.version == execution.version + 1;
                if !owned {
                    return Err(StoreError::Inconsistent(format!(
                        "picked {} but read back {}",
                        execution.key(),
                        picked
                    )));
                }
                Ok(Some(picked))
            }
            n => {
                error!(affected = n, "pick touched more than one row");
                Err(StoreError::ConsistencyViolation {
                    operation: Mutation::Picked,
                    affected: n,
                })
            }
        }
    }

    #[instrument(skip(self, execution), fields(execution = %execution.key(), version = execution.version))]
    fn update_heartbeat(&self, execution: &Execution, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            "update {} set last_heartbeat = ? where task_name = ? and task_instance = ? and version = ?",
            self.table
        );
        let [name, id, version] = Self::key_params(execution);
        match self
            .runner
            .execute(&sql, &[SqlParam::Timestamp(now), name, id, version])?
        {
            0 => {
                debug!("heartbeat matched no row");
                Ok(false)
            }
            1 => Ok(true),
            n => Err(StoreError::ConsistencyViolation {
                operation: Mutation::Updated,
                affected: n,
            }),
        }
    }

    #[instrument(skip(self, execution, update), fields(execution = %execution.key(), version = execution.version))]
    fn reschedule(&self, execution: &Execution, update: &Reschedule) -> Result<()> {
        let data_clause = if update.new_data.is_some() {
            "task_data = ?, "
        } else {
            ""
        };
        let sql = format!(
            "update {} set picked = ?, picked_by = ?, last_heartbeat = ?, last_success = ?, \
             last_failure = ?, consecutive_failures = ?, execution_time = ?, {data_clause}\
             version = version + 1 where task_name = ? and task_instance = ? and version = ?",
            self.table
        );

        let mut params = vec![
            SqlParam::Bool(false),
            SqlParam::Null,
            SqlParam::Null,
            SqlParam::opt_timestamp(update.last_success),
            SqlParam::opt_timestamp(update.last_failure),
            SqlParam::Int(i64::from(update.consecutive_failures)),
            SqlParam::Timestamp(update.execution_time),
        ];
        if let Some(data) = &update.new_data {
            params.push(SqlParam::Blob(data.clone()));
        }
        params.extend(Self::key_params(execution));

        let affected = self.runner.execute(&sql, &params)?;
        self.expect_one(execution, Mutation::Updated, affected)
    }

    #[instrument(skip(self, execution), fields(execution = %execution.key(), version = execution.version))]
    fn remove(&self, execution: &Execution) -> Result<()> {
        let sql = format!(
            "delete from {} where task_name = ? and task_instance = ? and version = ?",
            self.table
        );
        let affected = self.runner.execute(&sql, &Self::key_params(execution))?;
        self.expect_one(execution, Mutation::Removed, affected)
    }

    fn get_dead_executions(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>> {
        let query = self
            .select_from_table()
            .and_where(Condition::eq("picked", SqlParam::Bool(true)))
            .and_where(Condition::at_most(
                "last_heartbeat",
                SqlParam::Timestamp(older_than),
            ))
            .order_by("last_heartbeat asc");
        self.select_executions(&query)
    }

    #[instrument(skip(self, execution), fields(execution = %execution.key(), version = execution.version))]
    fn release_dead(
        &self,
        execution: &Execution,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "update {} set picked = ?, picked_by = ?, last_heartbeat = ?, last_failure = ?, \
             consecutive_failures = consecutive_failures + 1, execution_time = ?, version = version + 1 \
             where picked = ? and task_name = ? and task_instance = ? and version = ? and last_heartbeat <= ?",
            self.table
        );
        let [name, id, version] = Self::key_params(execution);
        let affected = self.runner.execute(
            &sql,
            &[
                SqlParam::Bool(false),
                SqlParam::Null,
                SqlParam::Null,
                SqlParam::Timestamp(now),
                SqlParam::Timestamp(now),
                SqlParam::Bool(true),
                name,
                id,
                version,
                SqlParam::Timestamp(older_than),
            ],
        )?;
        match affected {
            0 => {
                debug!("dead execution already recovered or refreshed");
                Ok(false)
            }
            1 => Ok(true),
            n => Err(StoreError::ConsistencyViolation {
                operation: Mutation::Updated,
                affected: n,
            }),
        }
    }

    fn get_scheduled_executions(&self, filter: &ScheduledFilter) -> Result<Vec<Execution>> {
        let mut query = self.select_from_table();
        if let Some(picked) = filter.picked {
            query = query.and_where(Condition::eq("picked", SqlParam::Bool(picked)));
        }
        if let Some(task_name) = &filter.task_name {
            query = query.and_where(Condition::eq("task_name", SqlParam::text(task_name)));
        }
        query = query.order_by(DUE_ORDER);
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = filter.offset {
            // SQLite only accepts OFFSET after LIMIT
            if filter.limit.is_none() {
                query = query.limit(u32::MAX);
            }
            query = query.offset(offset);
        }
        self.select_executions(&query)
    }

    fn get_executions_failing_longer_than(&self, since: DateTime<Utc>) -> Result<Vec<Execution>> {
        let query = self
            .select_from_table()
            .and_where(Condition::new(
                "((last_success is null and last_failure is not null) \
                 or (last_failure is not null and last_success < ?))",
                vec![SqlParam::Timestamp(since)],
            ))
            .order_by(DUE_ORDER);
        self.select_executions(&query)
    }
}
