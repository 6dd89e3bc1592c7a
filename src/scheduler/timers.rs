//! Delay and interval timers backing delayed and periodic tasks.
//!
//! Timers run on a small tokio runtime owned by the queue. Every armed timer is
//! one spawned task sleeping until its deadline; disarming aborts that task.

use crate::task::TaskId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerId(u64);

type ExpireFn = Arc<dyn Fn(TaskId) + Send + Sync>;

struct TimerEntry {
    task: TaskId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerState {
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
    stopped: bool,
}

struct Driver {
    runtime: Runtime,
    on_expire: ExpireFn,
}

pub(crate) struct TimerQueue {
    state: Arc<Mutex<TimerState>>,
    driver: Mutex<Option<Driver>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            driver: Mutex::new(None),
        }
    }

    /// Start the timer runtime. `on_expire` runs on its thread.
    pub(crate) fn start<F>(&self, on_expire: F) -> std::io::Result<()>
    where
        F: Fn(TaskId) + Send + Sync + 'static,
    {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("taskpool-timer")
            .enable_time()
            .build()?;
        *self.driver.lock() = Some(Driver {
            runtime,
            on_expire: Arc::new(on_expire),
        });
        Ok(())
    }

    /// Arm a timer for `task`. With an interval it keeps firing every
    /// `interval` after the first expiry, skipping ticks it missed.
    ///
    /// Returns `None` once the queue is stopped or when the deadline cannot
    /// be represented.
    pub(crate) fn schedule(
        &self,
        task: TaskId,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Option<TimerId> {
        let deadline = Instant::now().checked_add(delay)?;
        let driver = self.driver.lock();
        let driver = driver.as_ref()?;
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.next_id += 1;
        let id = TimerId(state.next_id);

        let timers = self.state.clone();
        let on_expire = driver.on_expire.clone();
        // The entry is inserted before the spawned task can take the lock
        let handle = match interval {
            None => driver.runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if timers.lock().entries.remove(&id).is_none() {
                    return;
                }
                debug!("Timer fired for task {}", task);
                on_expire(task);
            }),
            Some(period) => driver.runtime.spawn(async move {
                let mut ticker = tokio::time::interval_at(deadline, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !timers.lock().entries.contains_key(&id) {
                        return;
                    }
                    debug!("Interval tick for task {}", task);
                    on_expire(task);
                }
            }),
        };
        state.entries.insert(id, TimerEntry { task, handle });
        Some(id)
    }

    /// Disarm a timer. Returns whether it was still armed.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        match self.state.lock().entries.remove(&id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn armed(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Stop the runtime and return the tasks whose timers were still armed
    pub(crate) fn stop(&self) -> Vec<TaskId> {
        let pending = {
            let mut state = self.state.lock();
            state.stopped = true;
            state
                .entries
                .drain()
                .map(|(_, entry)| {
                    entry.handle.abort();
                    entry.task
                })
                .collect()
        };
        if let Some(driver) = self.driver.lock().take() {
            driver.runtime.shutdown_background();
        }
        pending
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async contexts
        if let Some(driver) = self.driver.get_mut().take() {
            driver.runtime.shutdown_background();
        }
    }
}
