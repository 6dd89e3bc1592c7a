use crate::error::TaskError;
use crate::pool::{WorkerId, WorkerRecord};
use crate::scheduler::manager::{ManagerState, Shared};
use crate::task::record::TaskInner;
use crate::task::{Priority, TaskContext, TaskEvent, TaskOutcome};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

impl Shared {
    /// Register and start a new worker thread
    pub(crate) fn spawn_worker_locked(&self, st: &mut ManagerState) -> Option<WorkerId> {
        let shared = self.self_ref.upgrade()?;
        let id = WorkerId::next();
        st.workers.insert(id, WorkerRecord::new());

        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, id))
            .spawn(move || run_worker(shared, id));
        match spawned {
            Ok(handle) => {
                if let Some(record) = st.workers.get_mut(&id) {
                    record.handle = Some(handle);
                }
                let pool_size = st.pool_size();
                debug!("Spawned worker {}, pool size {}", id, pool_size);
                self.host.emit(TaskEvent::WorkerSpawned {
                    worker_id: id,
                    pool_size,
                });
                Some(id)
            }
            Err(e) => {
                st.workers.remove(&id);
                warn!("Failed to spawn worker thread: {}", e);
                None
            }
        }
    }

    /// Block until there is a task for this worker, or return `None` when the
    /// worker must exit.
    fn next_task_for(&self, id: WorkerId) -> Option<Arc<TaskInner>> {
        let mut st = self.state.lock();
        loop {
            if self.is_shut_down() {
                return None;
            }
            if st.retiring.remove(&id) {
                st.workers.remove(&id);
                // Pass on a wakeup this worker may have consumed
                self.work_available.notify_one();
                return None;
            }

            let became_idle = st.workers.get_mut(&id).is_some_and(WorkerRecord::set_idle);
            if became_idle && st.queues.lane_len(Priority::Idle) > 0 {
                self.work_available.notify_all();
            }

            if !self.is_suspended() {
                if let Some(task) = self.dequeue_locked(&mut st) {
                    let priority = task.priority();
                    if let Some(record) = st.workers.get_mut(&id) {
                        record.assign(task.id, priority, task.is_long_running());
                    }
                    return Some(task);
                }
            }
            self.work_available.wait(&mut st);
        }
    }

    /// Run one task body on the current worker and hand the outcome back
    fn execute_on_worker(&self, worker: WorkerId, task: Arc<TaskInner>) {
        let queued = task
            .slot
            .lock()
            .enqueued_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);
        self.notify_started(&task, worker);
        if let Some(group) = task.group_id().and_then(|id| self.group(id)) {
            group.mark_running();
        }

        debug!("Worker {} running task {}", worker, task.id);
        let started = Instant::now();
        let ctx = TaskContext::new(task.clone(), self.self_ref.clone());
        let result = catch_unwind(AssertUnwindSafe(|| task.invoke(&ctx)));
        let cpu = started.elapsed();

        let outcome: TaskOutcome = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Execution {
                message: format!("{:#}", e),
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Task {} panicked: {}", task.id, message);
                Err(TaskError::Panicked { message })
            }
        };
        self.complete(&task, outcome, queued, cpu);
    }
}

fn run_worker(shared: Arc<Shared>, id: WorkerId) {
    debug!("Worker {} started", id);
    while let Some(task) = shared.next_task_for(id) {
        shared.execute_on_worker(id, task);
    }
    debug!("Worker {} exiting", id);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
