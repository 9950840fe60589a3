//! Transaction manager: the poll-loop driver for active commit tasks.

use std::sync::Mutex;

use crate::task::TaskHandle;

/// Owns the set of committing tasks and gives each a slice of progress per
/// poll. Tasks that reach `Done` are dropped from the active set; their
/// handles stay valid for whoever else holds one.
#[derive(Default)]
pub struct TransactionManager {
    tasks: Mutex<Vec<TaskHandle>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: TaskHandle) {
        self.tasks.lock().unwrap().push(task);
    }

    /// One sweep over the active tasks. The task list is snapshotted first
    /// so a task slice may itself reach back into the manager.
    pub fn poll(&self) {
        let active: Vec<TaskHandle> = self.tasks.lock().unwrap().clone();
        for task in &active {
            task.perform_task();
        }
        self.tasks.lock().unwrap().retain(|task| !task.is_done());
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}
