//! Shared timer service.
//!
//! Every timer in a stack (restore watchdog, delayed-ack flush, keepalive,
//! client re-establishment) is a task on one [`Scheduler`].

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Schedules work on a tokio runtime.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Scheduler on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// The runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    /// Run `f` every `period` (first run after one period) until it
    /// returns `false` or the task is cancelled.
    pub fn schedule_repeating<F>(&self, period: Duration, f: F) -> ScheduledTask
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !f() {
                    break;
                }
            }
        })
    }

    /// Run a future.
    pub fn spawn<F>(&self, future: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        ScheduledTask {
            handle: self.handle.spawn(future),
        }
    }
}

/// A scheduled task; dropping it does not cancel it.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stop the task if it has not run yet (or is between runs).
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the task has completed or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
