//! Example: submitting, draining, and waiting on tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use kestrel_dispatch::{Context, Dispatcher, DispatcherConfig, TaskPriority, TaskTarget};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut dispatcher = Dispatcher::new(DispatcherConfig::default())?;
    println!(
        "kestrel-dispatch v{} with {} worker(s)",
        kestrel_dispatch::VERSION,
        dispatcher.worker_count()
    );

    // Fan out pool work.
    let sum = Arc::new(AtomicU32::new(0));
    let set = {
        let sum = Arc::clone(&sum);
        dispatcher.submit_set(
            8,
            move |index| {
                sum.fetch_add(index as u32, Ordering::SeqCst);
            },
            TaskPriority::Normal,
            TaskTarget::Worker,
        )
    };
    set.wait_all();
    println!("pool sum = {}", sum.load(Ordering::SeqCst));

    // Work pinned to the "main" context only runs when its owner drains it.
    let pinned = dispatcher.submit(
        || println!("hello from the main context"),
        TaskPriority::High,
        TaskTarget::Main,
    );
    while !pinned.is_finished() {
        dispatcher.drain_pending(Context::Main);
        thread::sleep(Duration::from_millis(1));
    }

    let stats = dispatcher.stats();
    println!(
        "submitted={} completed={} canceled={} failed={}",
        stats.submitted, stats.completed, stats.canceled, stats.failed
    );

    dispatcher.shutdown();
    Ok(())
}
