//! Task sets
//!
//! Fan-out over an indexed closure with group wait/cancel.

use crate::task::TaskHandle;

/// A group of tasks submitted together via `Dispatcher::submit_set`.
#[derive(Debug)]
pub struct TaskSet {
    handles: Vec<TaskHandle>,
}

impl TaskSet {
    pub(crate) fn new(handles: Vec<TaskHandle>) -> Self {
        Self { handles }
    }

    /// Block until every task in the set reaches a terminal state
    /// (completed, canceled, or failed).
    pub fn wait_all(&self) {
        for handle in &self.handles {
            handle.wait();
        }
    }

    /// Request cancellation of every task in the set. Best effort, same as
    /// `TaskHandle::cancel`.
    pub fn cancel_all(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    /// Individual handles, in submission order.
    pub fn handles(&self) -> &[TaskHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
