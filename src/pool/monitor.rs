//! Background pass over the pool: blocked-worker detection, shrinking idle
//! workers and expansion for queued work.

use crate::pool::{WorkerId, WorkerState};
use crate::scheduler::manager::Shared;
use crate::task::TaskEvent;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

impl Shared {
    pub(crate) fn start_monitor(self: &Arc<Self>) -> std::io::Result<()> {
        let shared = self.clone();
        let handle = std::thread::Builder::new()
            .name("taskpool-monitor".to_string())
            .spawn(move || shared.run_monitor())?;
        *self.monitor_thread.lock() = Some(handle);
        Ok(())
    }

    fn run_monitor(&self) {
        let interval = self.config.monitor_interval();
        let mut stop = self.monitor_stop.lock();
        while !*stop {
            self.monitor_wake.wait_for(&mut stop, interval);
            if *stop {
                break;
            }
            drop(stop);
            self.check_blocked_workers();
            self.trigger_shrink(self.config.shrink_step);
            self.try_expand();
            stop = self.monitor_stop.lock();
        }
        debug!("Pool monitor stopped");
    }

    pub(crate) fn stop_monitor(&self) {
        *self.monitor_stop.lock() = true;
        self.monitor_wake.notify_all();
        if let Some(handle) = self.monitor_thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("Pool monitor thread panicked");
            }
        }
    }

    /// Flag workers whose current task ran longer than the blocked timeout.
    /// Their task keeps running; long-running tasks are exempt.
    pub(crate) fn check_blocked_workers(&self) -> Vec<WorkerId> {
        let timeout = self.config.blocked_timeout();
        let mut blocked = Vec::new();
        {
            let mut st = self.state.lock();
            for (id, record) in st.workers.iter_mut() {
                if record.state != WorkerState::Running || record.executing_long_task {
                    continue;
                }
                if record.started_at.is_some_and(|at| at.elapsed() >= timeout) {
                    record.state = WorkerState::Blocked;
                    warn!(
                        "Worker {} blocked on tasks {:?} for more than {:?}",
                        id, record.current_tasks, timeout
                    );
                    blocked.push(*id);
                }
            }
            if !blocked.is_empty() {
                self.try_expand_locked(&mut st);
            }
        }
        for id in &blocked {
            self.host.emit(TaskEvent::WorkerStateChanged {
                worker_id: *id,
                old_state: WorkerState::Running,
                new_state: WorkerState::Blocked,
            });
        }
        blocked
    }

    /// Retire up to `step` workers idle for longer than the idle timeout,
    /// never going below the minimum. Workers holding a long-running task
    /// stay until it is terminated. Skipped while suspended or while work
    /// is queued. Returns the number of workers retired.
    pub(crate) fn trigger_shrink(&self, step: usize) -> usize {
        if self.is_suspended() || self.is_shut_down() {
            return 0;
        }
        let idle_timeout = self.config.idle_timeout();
        let retired: Vec<(WorkerId, Option<JoinHandle<()>>)> = {
            let mut st = self.state.lock();
            if !st.queues.is_empty() {
                return 0;
            }
            let size = st.pool_size();
            if size <= self.config.min_workers {
                return 0;
            }
            let budget = step.min(size - self.config.min_workers);

            let mut candidates: Vec<(WorkerId, std::time::Instant)> = st
                .workers
                .iter()
                .filter(|(id, record)| {
                    record.state == WorkerState::Idle
                        && !record.has_long_task()
                        && !st.retiring.contains(id)
                        && record.idle_since.elapsed() >= idle_timeout
                })
                .map(|(id, record)| (*id, record.idle_since))
                .collect();
            candidates.sort_by_key(|(_, since)| *since);
            candidates.truncate(budget);

            let mut retired = Vec::with_capacity(candidates.len());
            for (id, _) in candidates {
                st.retiring.insert(id);
                let handle = st.workers.get_mut(&id).and_then(|record| record.handle.take());
                retired.push((id, handle));
            }
            if !retired.is_empty() {
                self.work_available.notify_all();
            }
            retired
        };

        let count = retired.len();
        for (id, handle) in retired {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("Worker {} panicked while retiring", id);
                }
            }
            let pool_size = self.state.lock().pool_size();
            self.host.emit(TaskEvent::WorkerRetired {
                worker_id: id,
                pool_size,
            });
        }
        if count > 0 {
            info!("Shrunk pool by {} workers", count);
        }
        count
    }

    /// Spawn workers while queued work exceeds idle capacity
    pub(crate) fn try_expand(&self) -> usize {
        let mut st = self.state.lock();
        let mut spawned = 0;
        while self.try_expand_locked(&mut st) {
            spawned += 1;
        }
        spawned
    }
}
