//! Task model
//!
//! A task is a boxed closure plus scheduling metadata and an observable
//! lifecycle. Ownership is shared: the submitting caller keeps a
//! [`TaskHandle`], and whichever queue or worker currently holds the task
//! keeps an `Arc` clone.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::check::check;

/// Work payload. The closure captures its own state; the scheduler never
/// inspects or copies it.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Number of priority levels (and submission queues).
pub const PRIORITY_LEVELS: usize = 5;

/// Scheduling priority. Higher levels get a larger share of admission draws,
/// but only probabilistically - lower levels are never starved outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
}

/// Admission weights, highest level first. The sum is [`WEIGHT_SUM`].
pub(crate) const PRIORITY_WEIGHTS: [(TaskPriority, u32); PRIORITY_LEVELS] = [
    (TaskPriority::Highest, 6),
    (TaskPriority::High, 5),
    (TaskPriority::Normal, 4),
    (TaskPriority::Low, 3),
    (TaskPriority::Lowest, 2),
];

pub(crate) const WEIGHT_SUM: u32 = 20;

impl TaskPriority {
    /// Get priority name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Highest => "highest",
        }
    }

    /// Index into the per-priority submission queues.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Where a task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskTarget {
    /// Any thread in the anonymous worker pool.
    Worker,
    /// The engine's main-loop thread.
    Main,
    /// The render-loop thread.
    Render,
    /// The blocking-I/O thread.
    Io,
}

impl Default for TaskTarget {
    fn default() -> Self {
        Self::Worker
    }
}

/// A named engine thread that cooperatively drains its own pending tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Main,
    Render,
    Io,
}

/// Observable task lifecycle state.
///
/// `Pending -> Running -> Completed` is the normal path. `Canceled` is
/// reached only at scheduling checkpoints, `Failed` only when the task body
/// panics. Terminal states are reached exactly once and never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Canceled = 3,
    Failed = 4,
}

impl TaskStatus {
    /// Whether the task will never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

/// A schedulable unit of work.
pub(crate) struct Task {
    /// Taken exactly once, by whichever thread runs the task.
    func: Mutex<Option<TaskFn>>,
    priority: TaskPriority,
    target: TaskTarget,
    status: AtomicU8,
    cancel_requested: AtomicBool,
    /// Set by waiters so finishers can skip the notify lock when nobody is
    /// blocked.
    has_waiter: AtomicBool,
    waiter_lock: Mutex<()>,
    finished: Condvar,
}

pub(crate) type TaskRef = Arc<Task>;

impl Task {
    pub(crate) fn new(func: TaskFn, priority: TaskPriority, target: TaskTarget) -> TaskRef {
        Arc::new(Self {
            func: Mutex::new(Some(func)),
            priority,
            target,
            status: AtomicU8::new(TaskStatus::Pending as u8),
            cancel_requested: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            waiter_lock: Mutex::new(()),
            finished: Condvar::new(),
        })
    }

    pub(crate) fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub(crate) fn target(&self) -> TaskTarget {
        self.target
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Move into a terminal state and release any waiter. Returns false if
    /// another terminal state won the race; the loser changes nothing.
    pub(crate) fn try_finish(&self, status: TaskStatus) -> bool {
        check(status.is_terminal(), "try_finish requires a terminal status");

        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if TaskStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                status as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.notify_waiters();
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Run the payload on the current thread.
    ///
    /// Transitions `Pending -> Running`. On success the task is left
    /// `Running`; the dispatcher's completion sweep marks it `Completed`. A
    /// panicking body is caught here and the task goes straight to `Failed`.
    pub(crate) fn run(&self) {
        if self
            .status
            .compare_exchange(
                TaskStatus::Pending as u8,
                TaskStatus::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let func = self.func.lock().unwrap().take();
        let Some(func) = func else { return };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(func));
        if outcome.is_err() {
            tracing::error!(priority = self.priority.name(), "task body panicked");
            self.try_finish(TaskStatus::Failed);
        }
    }

    /// The waiter sets `has_waiter` before blocking and re-checks status
    /// under the lock, so a finisher that reads `has_waiter == false` here
    /// cannot strand it.
    fn notify_waiters(&self) {
        if self.has_waiter.load(Ordering::SeqCst) {
            let _guard = self.waiter_lock.lock().unwrap();
            self.finished.notify_all();
        }
    }
}

/// Caller-side handle to a submitted task.
///
/// Cloning is cheap; every clone observes the same task.
#[derive(Clone)]
pub struct TaskHandle {
    task: TaskRef,
}

impl TaskHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == TaskStatus::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.status() == TaskStatus::Canceled
    }

    pub fn is_failed(&self) -> bool {
        self.status() == TaskStatus::Failed
    }

    /// Whether the task reached any terminal state.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Request cancellation. Best effort: the request is honored only at
    /// scheduling checkpoints, never by interrupting a running body. No-op
    /// once the task is terminal.
    pub fn cancel(&self) {
        if self.task.status().is_terminal() {
            return;
        }
        self.task.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Block until the task reaches a terminal state.
    ///
    /// Caller contract: waiting from inside the task's own body deadlocks.
    pub fn wait(&self) {
        if self.task.status().is_terminal() {
            return;
        }
        self.task.has_waiter.store(true, Ordering::SeqCst);

        let mut guard = self.task.waiter_lock.lock().unwrap();
        while !self.task.status().is_terminal() {
            guard = self.task.finished.wait(guard).unwrap();
        }
    }

    /// Bounded wait. Returns whether a terminal state was observed; on
    /// timeout the task keeps running in the background.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.task.status().is_terminal() {
            return true;
        }
        self.task.has_waiter.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        let mut guard = self.task.waiter_lock.lock().unwrap();
        while !self.task.status().is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return self.task.status().is_terminal();
            }
            let (next, _timed_out) = self
                .task
                .finished
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = next;
        }
        true
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("priority", &self.task.priority())
            .field("target", &self.task.target())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task() -> TaskRef {
        Task::new(Box::new(|| {}), TaskPriority::Normal, TaskTarget::Worker)
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = noop_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!task.cancel_requested());
    }

    #[test]
    fn test_terminal_state_is_exclusive() {
        let task = noop_task();
        assert!(task.try_finish(TaskStatus::Completed));
        // Losing transition changes nothing.
        assert!(!task.try_finish(TaskStatus::Canceled));
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_run_leaves_running_until_swept() {
        let task = noop_task();
        task.run();
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(task.try_finish(TaskStatus::Completed));
    }

    #[test]
    fn test_run_catches_panic() {
        let task = Task::new(
            Box::new(|| panic!("task exploded")),
            TaskPriority::Normal,
            TaskTarget::Worker,
        );
        task.run();
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_canceled_task_never_runs() {
        let task = noop_task();
        assert!(task.try_finish(TaskStatus::Canceled));
        task.run();
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[test]
    fn test_wait_for_zero_on_terminal() {
        let task = noop_task();
        let handle = TaskHandle::new(Arc::clone(&task));
        assert!(!handle.wait_for(Duration::from_millis(0)));

        task.try_finish(TaskStatus::Completed);
        assert!(handle.wait_for(Duration::from_millis(0)));
        assert!(handle.is_completed());
    }

    #[test]
    fn test_cancel_after_terminal_is_noop() {
        let task = noop_task();
        task.try_finish(TaskStatus::Completed);

        let handle = TaskHandle::new(Arc::clone(&task));
        handle.cancel();
        assert!(!task.cancel_requested());
        assert!(handle.is_completed());
        assert!(!handle.is_canceled());
    }

    #[test]
    fn test_wait_releases_after_finish() {
        let task = noop_task();
        let handle = TaskHandle::new(Arc::clone(&task));

        let waiter = std::thread::spawn(move || {
            handle.wait();
        });

        std::thread::sleep(Duration::from_millis(20));
        task.try_finish(TaskStatus::Completed);
        waiter.join().unwrap();
    }

    #[test]
    fn test_priority_names_and_weights() {
        assert_eq!(TaskPriority::Highest.name(), "highest");
        assert_eq!(TaskPriority::Lowest.name(), "lowest");

        let sum: u32 = PRIORITY_WEIGHTS.iter().map(|(_, w)| w).sum();
        assert_eq!(sum, WEIGHT_SUM);
        // Walk order is highest first.
        assert_eq!(PRIORITY_WEIGHTS[0].0, TaskPriority::Highest);
        assert_eq!(PRIORITY_WEIGHTS[PRIORITY_LEVELS - 1].0, TaskPriority::Lowest);
    }
}
