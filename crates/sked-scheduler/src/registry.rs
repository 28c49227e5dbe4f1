use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::task::Task;

/// Task name → behaviour.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task + 'static>(&mut self, task: T) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(SchedulerError::DuplicateTask(name));
        }
        self.tasks.insert(name, Arc::new(task));
        Ok(())
    }

    /// Builder-style [`TaskRegistry::register`].
    pub fn with<T: Task + 'static>(mut self, task: T) -> Result<Self> {
        self.register(task)?;
        Ok(self)
    }

    pub fn resolve(&self, task_name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_name).cloned()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<dyn Task>> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
