//! Recurring Task Scheduler
//!
//! Drives tasks that decide for themselves how long to wait before the next
//! run and when to stop. Every task gets a lightweight loop on the shared
//! tokio runtime instead of a dedicated timer thread.
//!
//! ## Loop
//! 1. Ask the task for its next interval and sleep for it.
//! 2. If the task reports itself cancelled, stop.
//! 3. Otherwise run it once. A panicking run is logged and the loop continues.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A unit of recurring work.
pub trait Task: Send + Sync {
    /// Checked after every sleep; `true` ends the schedule.
    fn cancelled(&self) -> bool;

    /// Delay before the next execution. Queried again after every run.
    fn next_interval(&self) -> Duration;

    fn run(&self);
}

/// Shared scheduler service, one per stack.
pub struct TimeScheduler {
    /// Live loops keyed by task identity, so adding a task that is still
    /// scheduled does not start a second loop for it.
    loops: Mutex<HashMap<usize, JoinHandle<()>>>,
}

impl TimeScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loops: Mutex::new(HashMap::new()),
        })
    }

    /// Schedules `task`. Re-adding a task whose loop has ended restarts it;
    /// re-adding one that is still scheduled is a no-op.
    pub fn add(&self, task: Arc<dyn Task>) {
        let key = task_key(&task);
        let mut loops = self.loops.lock();

        loops.retain(|_, handle| !handle.is_finished());

        if loops.contains_key(&key) {
            tracing::trace!("Task {:#x} already scheduled", key);
            return;
        }

        let handle = tokio::spawn(run_task_loop(task));
        loops.insert(key, handle);
    }

    /// Number of task loops that are still alive.
    pub fn active_tasks(&self) -> usize {
        let mut loops = self.loops.lock();
        loops.retain(|_, handle| !handle.is_finished());
        loops.len()
    }

    /// Aborts every scheduled loop.
    pub fn stop(&self) {
        let mut loops = self.loops.lock();
        for (_, handle) in loops.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimeScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.loops.get_mut().drain() {
            handle.abort();
        }
    }
}

fn task_key(task: &Arc<dyn Task>) -> usize {
    Arc::as_ptr(task) as *const () as usize
}

async fn run_task_loop(task: Arc<dyn Task>) {
    loop {
        tokio::time::sleep(task.next_interval()).await;

        if task.cancelled() {
            tracing::trace!("Task cancelled, leaving schedule");
            break;
        }

        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            tracing::error!("Scheduled task panicked; continuing with next run");
        }
    }
}
