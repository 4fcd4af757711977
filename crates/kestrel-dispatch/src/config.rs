//! Dispatcher configuration

use std::time::Duration;

/// Tuning knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool size. `None` derives it from the machine, reserving
    /// headroom for the named engine threads (floor of 2).
    pub worker_count: Option<usize>,

    /// Coordinator sleep when a pass admitted nothing and completed nothing.
    /// Never applied while shutdown is draining.
    pub idle_sleep: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            idle_sleep: Duration::from_micros(100),
        }
    }
}

impl DispatcherConfig {
    /// Resolve the effective worker count.
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(default_worker_count).max(1)
    }
}

/// Hardware concurrency minus a margin reserved for the main/render/IO
/// threads; floor of 2 so low-core machines still make progress.
fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);
    if cores > 6 { cores - 4 } else { 2 }
}
