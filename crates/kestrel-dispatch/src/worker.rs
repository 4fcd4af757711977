//! Worker state machine
//!
//! One dedicated OS thread per worker. The coordinator drives
//! `Idle -> Ready` (assign + execute) and `Finished -> Idle` (finish_task);
//! the worker's own thread drives `Ready -> Busy -> Finished`. No other
//! writer exists for any transition, which is what keeps the machine safe
//! without a global lock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::check::{contract_violation, ensure};
use crate::task::TaskRef;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerStatus {
    Uninitialized = 0,
    /// No task held. `assign_task` / `execute` are legal.
    Idle = 1,
    /// Task committed; the worker thread has not picked it up yet.
    Ready = 2,
    /// Task running.
    Busy = 3,
    /// Task done. Needs `finish_task` to recycle back to Idle.
    Finished = 4,
    Exited = 5,
}

impl WorkerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Idle,
            2 => Self::Ready,
            3 => Self::Busy,
            4 => Self::Finished,
            _ => Self::Exited,
        }
    }
}

/// State shared between the coordinator and the worker thread.
struct Shared {
    status: AtomicU8,
    exit_requested: AtomicBool,
    /// Valid only while status is Ready/Busy/Finished. Written by the
    /// coordinator when Idle, taken back by it when Finished.
    task: Mutex<Option<TaskRef>>,
    /// Pairs with both condvars; status stores that must be observed by a
    /// sleeping thread happen under this lock.
    lock: Mutex<()>,
    wake: Condvar,
    started: Condvar,
}

impl Shared {
    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread. Pair with `wait_started` before dispatching.
    pub(crate) fn spawn(index: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            status: AtomicU8::new(WorkerStatus::Uninitialized as u8),
            exit_requested: AtomicBool::new(false),
            task: Mutex::new(None),
            lock: Mutex::new(()),
            wake: Condvar::new(),
            started: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("kestrel-worker-{index}"))
            .spawn(move || worker_loop(thread_shared))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Block until the worker thread has come up and reached Idle.
    pub(crate) fn wait_started(&self) {
        let mut guard = self.shared.lock.lock().unwrap();
        while self.shared.status() == WorkerStatus::Uninitialized {
            guard = self.shared.started.wait(guard).unwrap();
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.shared.status() == WorkerStatus::Idle
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.shared.status() == WorkerStatus::Finished
    }

    /// Store the next task. Coordinator-only; the worker must be Idle.
    pub(crate) fn assign_task(&self, task: TaskRef) {
        ensure(
            self.shared.status() == WorkerStatus::Idle,
            "assign_task on a non-Idle worker",
        );
        *self.shared.task.lock().unwrap() = Some(task);
    }

    /// Commit the assigned task and wake the worker thread.
    ///
    /// The Ready store happens under the worker lock, before the notify, so
    /// the worker thread can never observe the wake without the status. That
    /// ordering is what prevents a lost wakeup.
    pub(crate) fn execute(&self) {
        ensure(
            self.shared.status() == WorkerStatus::Idle,
            "execute on a non-Idle worker",
        );
        ensure(
            self.shared.task.lock().unwrap().is_some(),
            "execute with no task assigned",
        );

        let guard = self.shared.lock.lock().unwrap();
        self.shared
            .status
            .store(WorkerStatus::Ready as u8, Ordering::SeqCst);
        drop(guard);
        self.shared.wake.notify_one();
    }

    /// Take back the completed task and recycle the worker to Idle. This is
    /// the only path from Finished back to Idle.
    pub(crate) fn finish_task(&self) -> TaskRef {
        ensure(
            self.shared.status() == WorkerStatus::Finished,
            "finish_task on a non-Finished worker",
        );

        let task = self.shared.task.lock().unwrap().take();
        let Some(task) = task else {
            contract_violation("Finished worker holds no task");
        };
        self.shared
            .status
            .store(WorkerStatus::Idle as u8, Ordering::SeqCst);
        task
    }

    /// Ask the thread to exit at its next wake. A task already committed via
    /// `execute` is still run to completion first.
    pub(crate) fn exit(&self) {
        self.shared.exit_requested.store(true, Ordering::SeqCst);
        let _guard = self.shared.lock.lock().unwrap();
        self.shared.wake.notify_all();
    }

    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    shared
        .status
        .store(WorkerStatus::Idle as u8, Ordering::SeqCst);
    {
        let _guard = shared.lock.lock().unwrap();
        shared.started.notify_all();
    }
    tracing::trace!("worker online");

    loop {
        {
            let mut guard = shared.lock.lock().unwrap();
            while shared.status() != WorkerStatus::Ready {
                if shared.exit_requested.load(Ordering::SeqCst) {
                    shared
                        .status
                        .store(WorkerStatus::Exited as u8, Ordering::SeqCst);
                    tracing::trace!("worker exiting");
                    return;
                }
                // Timed wait so a missed exit request cannot park us forever.
                let (next, _timed_out) = shared
                    .wake
                    .wait_timeout(guard, Duration::from_millis(100))
                    .unwrap();
                guard = next;
            }
        }

        // Ready is committed; only this thread moves the machine forward now.
        shared
            .status
            .store(WorkerStatus::Busy as u8, Ordering::SeqCst);

        let task = shared.task.lock().unwrap().clone();
        if let Some(task) = task {
            task.run();
        }

        shared
            .status
            .store(WorkerStatus::Finished as u8, Ordering::SeqCst);
    }
}
