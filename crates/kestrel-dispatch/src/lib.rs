//! Kestrel Dispatch
//!
//! Cooperative multi-queue task dispatcher for the engine's threads.
//!
//! Work is submitted with a priority and a target: either the anonymous
//! worker pool (dedicated OS threads) or one of the engine's named contexts
//! (main loop, render loop, I/O), which drain their own tasks cooperatively
//! each tick. A single coordinator thread admits tasks with a
//! priority-weighted random policy, routes them, and reconciles completions.
//! Callers keep a [`TaskHandle`] to wait on or cancel a task.
//!
//! # Example
//! ```rust,ignore
//! use kestrel_dispatch::{Dispatcher, DispatcherConfig, TaskPriority, TaskTarget};
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//! let handle = dispatcher.submit(|| heavy_work(), TaskPriority::High, TaskTarget::Worker);
//! handle.wait();
//! ```

mod check;
mod config;
mod dispatcher;
mod queue;
mod set;
mod task;
mod worker;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchError, Dispatcher, DispatcherStats};
pub use set::TaskSet;
pub use task::{Context, PRIORITY_LEVELS, TaskFn, TaskHandle, TaskPriority, TaskStatus, TaskTarget};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
