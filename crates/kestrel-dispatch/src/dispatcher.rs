//! Work dispatcher
//!
//! One coordinator thread owns admission, routing, and completion. Pool
//! tasks execute on dedicated worker threads; tasks addressed to a named
//! engine thread wait in that context's queue until the owning thread drains
//! it via [`Dispatcher::drain_pending`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DispatcherConfig;
use crate::queue::TaskQueue;
use crate::set::TaskSet;
use crate::task::{
    Context, PRIORITY_LEVELS, PRIORITY_WEIGHTS, Task, TaskHandle, TaskPriority, TaskRef,
    TaskStatus, TaskTarget, WEIGHT_SUM,
};
use crate::worker::Worker;

/// Dispatcher startup errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// XorShift generator for admission draws. Same generator the engine uses
/// elsewhere for load-spreading decisions; statistical weighting is all the
/// policy asks for.
struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_below(&mut self, max: u32) -> u32 {
        (self.next() % max as u64) as u32
    }
}

/// Queues and counters shared by producers, the coordinator, and the named
/// context threads. Each queue has its own lock; there is no global one.
struct Inner {
    submit_queues: [TaskQueue<TaskRef>; PRIORITY_LEVELS],
    pending_main: Mutex<VecDeque<TaskRef>>,
    pending_render: Mutex<VecDeque<TaskRef>>,
    pending_io: Mutex<VecDeque<TaskRef>>,
    /// Completion queue fed by context drains; emptied by the coordinator's
    /// sweep.
    finished: TaskQueue<TaskRef>,
    shutdown: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    canceled: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn new() -> Self {
        Self {
            submit_queues: std::array::from_fn(|_| TaskQueue::new()),
            pending_main: Mutex::new(VecDeque::new()),
            pending_render: Mutex::new(VecDeque::new()),
            pending_io: Mutex::new(VecDeque::new()),
            finished: TaskQueue::new(),
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn context_queue(&self, context: Context) -> &Mutex<VecDeque<TaskRef>> {
        match context {
            Context::Main => &self.pending_main,
            Context::Render => &self.pending_render,
            Context::Io => &self.pending_io,
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn submit_queues_empty(&self) -> bool {
        self.submit_queues.iter().all(|queue| queue.is_empty())
    }

    /// Weighted-random admission. Draw `r` in `[0, WEIGHT_SUM)` and walk the
    /// levels from Highest down, accumulating weights; the first level whose
    /// cumulative weight exceeds `r` is the candidate, and an empty candidate
    /// falls through to the next lower level. All buckets empty for this draw
    /// means no admission this pass, which is not an error.
    ///
    /// The weighting is approximate across non-empty buckets: sustained
    /// high-priority load bounds low-priority starvation only
    /// probabilistically, and empty intermediate buckets shift the
    /// fall-through toward lower levels.
    fn checkout_by_priority(&self, rng: &mut XorShift) -> Option<TaskRef> {
        let lucky = rng.next_below(WEIGHT_SUM);
        let mut sum = 0;
        for (priority, weight) in PRIORITY_WEIGHTS {
            sum += weight;
            if sum > lucky {
                if let Some(task) = self.submit_queues[priority.index()].try_pop() {
                    return Some(task);
                }
            }
        }
        None
    }

    /// Cancellation checkpoint. Returns whether the task must be discarded
    /// instead of routed/executed.
    fn check_cancel(&self, task: &TaskRef) -> bool {
        if !task.cancel_requested() {
            return false;
        }
        if task.try_finish(TaskStatus::Canceled) {
            self.canceled.fetch_add(1, Ordering::Relaxed);
        }
        // A cancel request that raced an already-running task loses; the
        // task keeps its single terminal state.
        task.status().is_terminal()
    }

    /// Mark an executed task Completed, waking any waiter. A body that
    /// already failed keeps `Failed`; only the counter is updated.
    fn finalize(&self, task: &TaskRef) {
        if task.try_finish(TaskStatus::Completed) {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else if task.status() == TaskStatus::Failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drain the completion queue, finalizing everything in it.
    fn sweep_finished_queue(&self) -> usize {
        let mut swept = 0;
        while let Some(task) = self.finished.try_pop() {
            self.finalize(&task);
            swept += 1;
        }
        swept
    }
}

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherStats {
    /// Worker pool size.
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub canceled: u64,
    pub failed: u64,
    /// Submission queue depths, indexed by priority (Lowest first).
    pub queued: [usize; PRIORITY_LEVELS],
}

impl DispatcherStats {
    /// Total tasks awaiting admission.
    pub fn queued_total(&self) -> usize {
        self.queued.iter().sum()
    }
}

/// The coordinating authority over queues, the worker pool, and completion.
///
/// Constructed once at engine startup and passed by reference to every
/// component that submits or drains tasks; there is no global instance.
pub struct Dispatcher {
    inner: Arc<Inner>,
    coordinator: Option<JoinHandle<()>>,
    worker_count: usize,
}

impl Dispatcher {
    /// Spawn the worker pool and the coordinator thread. Returns once every
    /// worker thread is up and idle.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let worker_count = config.effective_worker_count();
        let inner = Arc::new(Inner::new());

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            workers.push(Worker::spawn(index)?);
        }
        for worker in &workers {
            worker.wait_started();
        }
        tracing::info!(workers = worker_count, "created worker thread(s)");

        let loop_inner = Arc::clone(&inner);
        let idle_sleep = config.idle_sleep;
        let coordinator = thread::Builder::new()
            .name("kestrel-dispatch".to_string())
            .spawn(move || coordinator_loop(loop_inner, workers, idle_sleep))?;

        Ok(Self {
            inner,
            coordinator: Some(coordinator),
            worker_count,
        })
    }

    /// Enqueue work. Never blocks; admission and routing happen on the
    /// coordinator thread.
    pub fn submit<F>(&self, func: F, priority: TaskPriority, target: TaskTarget) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new(Box::new(func), priority, target);
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        if self.inner.shutdown_requested() {
            // The coordinator may already have drained and exited; park the
            // task straight on the main context so it still gets drained.
            self.inner
                .pending_main
                .lock()
                .unwrap()
                .push_back(Arc::clone(&task));
        } else {
            self.inner.submit_queues[priority.index()].push(Arc::clone(&task));
        }
        TaskHandle::new(task)
    }

    /// Fan out `count` tasks over `func(index)`, all at the same priority
    /// and target.
    pub fn submit_set<F>(
        &self,
        count: usize,
        func: F,
        priority: TaskPriority,
        target: TaskTarget,
    ) -> TaskSet
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let handles = (0..count)
            .map(|index| {
                let func = Arc::clone(&func);
                self.submit(move || func(index), priority, target)
            })
            .collect();
        TaskSet::new(handles)
    }

    /// Dequeue and synchronously run every task currently pending for
    /// `context`. Called by the owning context thread once per tick; returns
    /// immediately when empty, never waits for new work. Returns the number
    /// of tasks run.
    pub fn drain_pending(&self, context: Context) -> usize {
        let mut local = {
            let mut queue = self.inner.context_queue(context).lock().unwrap();
            std::mem::take(&mut *queue)
        };

        let mut ran = 0;
        for task in local.drain(..) {
            if self.inner.check_cancel(&task) {
                continue;
            }
            task.run();
            ran += 1;
            self.inner.finished.push(task);
        }

        // Once shutdown is requested the coordinator may already be gone, so
        // completion falls to whoever drained. `finalize` is idempotent, so
        // racing the coordinator's own sweep is harmless.
        if self.inner.shutdown_requested() {
            self.inner.sweep_finished_queue();
        }

        ran
    }

    /// Flip the process-wide shutdown flag. From here on every admitted task
    /// is rerouted to the Main context so remaining work drains on one known
    /// thread; the coordinator keeps going until the pool is empty.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        tracing::info!("dispatcher shutdown requested");
    }

    /// Request shutdown and block until the coordinator has drained the pool
    /// and joined every worker thread. Tasks rerouted to the Main context
    /// still need its owner to call `drain_pending(Context::Main)`.
    pub fn shutdown(&mut self) {
        self.request_shutdown();
        if let Some(thread) = self.coordinator.take() {
            let _ = thread.join();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Snapshot of the counters and queue depths.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            workers: self.worker_count,
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            canceled: self.inner.canceled.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            queued: std::array::from_fn(|index| self.inner.submit_queues[index].len()),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.worker_count)
            .field("running", &self.coordinator.is_some())
            .finish()
    }
}

/// Coordinator loop. Each pass: completion sweep, worker dispatch, one
/// weighted admission, routing. Sleeps briefly only when a pass did nothing,
/// and never while shutdown is draining.
fn coordinator_loop(inner: Arc<Inner>, mut workers: Vec<Worker>, idle_sleep: Duration) {
    let mut backlog: VecDeque<TaskRef> = VecDeque::new();
    let mut rng = XorShift::new(0x9E37_79B9_7F4A_7C15);

    loop {
        let shutting_down = inner.shutdown_requested();

        let completions = process_finished(&inner, &workers);
        dispatch_worker_tasks(&inner, &workers, &mut backlog);

        let mut admitted = false;
        if let Some(task) = inner.checkout_by_priority(&mut rng) {
            admitted = true;
            if !inner.check_cancel(&task) {
                route(&inner, &mut backlog, task, shutting_down);
            }
        }

        if shutting_down
            && !admitted
            && backlog.is_empty()
            && inner.submit_queues_empty()
            && workers.iter().all(Worker::is_idle)
        {
            break;
        }

        if !shutting_down && !admitted && completions == 0 {
            thread::sleep(idle_sleep);
        }
    }

    // Completions that raced the exit decision.
    process_finished(&inner, &workers);

    for worker in &workers {
        worker.exit();
    }
    for worker in &mut workers {
        worker.join();
    }
    tracing::info!("dispatcher drained and stopped");
}

/// Completion sweep: recycle every Finished worker and drain the completion
/// queue fed by the context drains.
fn process_finished(inner: &Inner, workers: &[Worker]) -> usize {
    let mut completions = 0;
    for worker in workers {
        if worker.is_finished() {
            let task = worker.finish_task();
            inner.finalize(&task);
            completions += 1;
        }
    }
    completions + inner.sweep_finished_queue()
}

/// Hand backlog tasks to idle workers, checking cancellation immediately
/// before each execute.
fn dispatch_worker_tasks(inner: &Inner, workers: &[Worker], backlog: &mut VecDeque<TaskRef>) {
    if backlog.is_empty() {
        return;
    }
    for worker in workers {
        if backlog.is_empty() {
            return;
        }
        if !worker.is_idle() {
            continue;
        }
        while let Some(task) = backlog.pop_front() {
            if inner.check_cancel(&task) {
                continue;
            }
            worker.assign_task(task);
            worker.execute();
            break;
        }
    }
}

/// Route an admitted task to its destination. While shutdown is requested,
/// everything lands on the Main context so remaining work drains on one
/// known thread instead of being dropped.
fn route(inner: &Inner, backlog: &mut VecDeque<TaskRef>, task: TaskRef, shutting_down: bool) {
    let target = if shutting_down {
        TaskTarget::Main
    } else {
        task.target()
    };
    match target {
        TaskTarget::Worker => backlog.push_back(task),
        TaskTarget::Main => inner.pending_main.lock().unwrap().push_back(task),
        TaskTarget::Render => inner.pending_render.lock().unwrap().push_back(task),
        TaskTarget::Io => inner.pending_io.lock().unwrap().push_back(task),
    }
}
