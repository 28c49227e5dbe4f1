use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Identity of a schedulable unit.
///
/// `(task_name, id)` is the natural key shared by every execution of the
/// instance over time. `data` is an opaque payload; the JSON helpers are a
/// convenience, the store never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            id: id.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach `value` serialised as JSON.
    pub fn with_json<T: Serialize>(self, value: &T) -> crate::Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.with_data(bytes))
    }

    /// Decode the payload as JSON. `None` when the instance carries no data.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<Option<T>> {
        match &self.data {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn key(&self) -> ExecutionKey {
        ExecutionKey {
            task_name: self.task_name.clone(),
            instance_id: self.id.clone(),
        }
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.id)
    }
}

/// Primary key of the executions table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub task_name: String,
    pub instance_id: String,
}

impl ExecutionKey {
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.instance_id)
    }
}

/// A persisted, scheduled occurrence of a [`TaskInstance`].
///
/// `version` is the only optimistic-lock token: every state-changing write is
/// conditioned on it and bumps it by one. `picked` implies `picked_by` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub task_instance: TaskInstance,
    pub execution_time: DateTime<Utc>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub version: i64,
}

impl Execution {
    /// A fresh, unpicked execution as it is inserted (version 1).
    pub fn new(task_instance: TaskInstance, execution_time: DateTime<Utc>) -> Self {
        Self {
            task_instance,
            execution_time,
            picked: false,
            picked_by: None,
            last_heartbeat: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            version: 1,
        }
    }

    pub fn key(&self) -> ExecutionKey {
        self.task_instance.key()
    }

    pub fn task_name(&self) -> &str {
        &self.task_instance.task_name
    }

    pub fn instance_id(&self) -> &str {
        &self.task_instance.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.picked && self.execution_time <= now
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Execution({}, at={}, picked={}, picked_by={}, version={})",
            self.task_instance,
            self.execution_time.to_rfc3339(),
            self.picked,
            self.picked_by.as_deref().unwrap_or("-"),
            self.version
        )
    }
}

/// A task instance paired with the instant it should first run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulableInstance {
    pub instance: TaskInstance,
    pub execution_time: DateTime<Utc>,
}

impl SchedulableInstance {
    pub fn new(instance: TaskInstance, execution_time: DateTime<Utc>) -> Self {
        Self {
            instance,
            execution_time,
        }
    }

    pub fn into_execution(self) -> Execution {
        Execution::new(self.instance, self.execution_time)
    }
}
