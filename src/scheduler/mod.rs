//! The scheduler: task registry, priority lanes, dependency resolution and
//! the worker pool behind them.

pub(crate) mod dependency;
pub(crate) mod host;
pub mod info;
pub(crate) mod manager;
pub(crate) mod queue;
pub(crate) mod timers;

pub(crate) use manager::Shared;

use crate::config::PoolConfig;
use crate::error::{Result, TaskPoolError};
use crate::group::sequence_runner::RunnerInner;
use crate::group::task_group::GroupInner;
use crate::group::{SequenceRunner, TaskGroup};
use crate::locks::LockManager;
use crate::task::handle::channel;
use crate::task::record::TaskInner;
use crate::task::*;
use manager::Placement;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use info::{PoolInfo, QueueDepth, TaskInfo, WorkerInfo};

/// Owner of a worker pool and everything scheduled on it.
///
/// Dropping the scheduler shuts it down: queued work is rejected with
/// [`TaskError::Shutdown`](crate::TaskError::Shutdown) and worker threads are
/// joined after their current task returns.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Build a scheduler and start `min_workers` workers
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak| Shared::new(config, weak.clone()));
        // From here on a failed start shuts the partial pool down on drop
        let scheduler = Self { shared };
        let shared = &scheduler.shared;

        shared.host.start()?;
        let timer_target = Arc::downgrade(shared);
        shared.timers.start(move |task| {
            if let Some(shared) = timer_target.upgrade() {
                shared.on_timer(task);
            }
        })?;
        shared.start_monitor()?;

        {
            let mut st = shared.state.lock();
            for _ in 0..shared.config.min_workers {
                if shared.spawn_worker_locked(&mut st).is_none() {
                    return Err(TaskPoolError::Io(std::io::Error::other(
                        "failed to spawn the minimum number of workers",
                    )));
                }
            }
        }

        info!(
            "Task pool started with {}..={} workers",
            shared.config.min_workers, shared.config.max_workers
        );
        Ok(scheduler)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Create a task that can be executed, grouped or sequenced later
    pub fn create_task<F>(&self, name: impl Into<String>, payload: F) -> Task
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        self.create_task_with(name, FnPayload::arc(payload), TaskType::Plain)
    }

    /// Create a task exempt from blocked-worker detection. It can run once.
    pub fn create_long_task<F>(&self, name: impl Into<String>, payload: F) -> Task
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        self.create_task_with(name, FnPayload::arc(payload), TaskType::LongRunning)
    }

    /// Create a task around any [`Payload`] implementation
    pub fn create_task_with(
        &self,
        name: impl Into<String>,
        payload: Arc<dyn Payload>,
        kind: TaskType,
    ) -> Task {
        let kind = match kind {
            TaskType::LongRunning => TaskType::LongRunning,
            _ => TaskType::Plain,
        };
        let inner = self.shared.register(TaskInner::new(name, payload, kind));
        Task::new(inner, Arc::downgrade(&self.shared))
    }

    fn check_standalone(task: &Task) -> Result<()> {
        let inner = task.inner();
        if !inner.is_unowned() {
            return Err(TaskPoolError::validation(format!(
                "task {} is owned by a group or sequence runner",
                inner.id
            )));
        }
        if inner.is_periodic() {
            return Err(TaskPoolError::validation(format!(
                "task {} is periodic",
                inner.id
            )));
        }
        Ok(())
    }

    /// Queue a task for execution
    pub fn execute(&self, task: &Task, priority: Priority) -> Result<TaskHandle> {
        Self::check_standalone(task)?;
        let (resolver, handle) = channel(task.id().as_u64());
        self.shared
            .start_execution(task.inner(), priority, Some(resolver), Placement::Ready)?;
        Ok(handle)
    }

    /// Queue a task once `delay` has elapsed
    pub fn execute_delayed(
        &self,
        task: &Task,
        priority: Priority,
        delay: Duration,
    ) -> Result<TaskHandle> {
        Self::check_standalone(task)?;
        check_delay("delay", delay)?;
        let (resolver, handle) = channel(task.id().as_u64());
        self.shared.start_execution(
            task.inner(),
            priority,
            Some(resolver),
            Placement::Delayed(delay),
        )?;
        Ok(handle)
    }

    /// Run a task every `interval` until it is cancelled. The handle resolves
    /// with a cancellation error once that happens.
    pub fn execute_periodically(
        &self,
        task: &Task,
        priority: Priority,
        interval: Duration,
    ) -> Result<TaskHandle> {
        Self::check_standalone(task)?;
        check_delay("interval", interval)?;
        if task.is_long_running() {
            return Err(TaskPoolError::validation(format!(
                "long-running task {} cannot be periodic",
                task.id()
            )));
        }
        let (resolver, handle) = channel(task.id().as_u64());
        self.shared.start_execution(
            task.inner(),
            priority,
            Some(resolver),
            Placement::Periodic(interval),
        )?;
        Ok(handle)
    }

    /// Register an anonymous task and run it after `dependencies` finish
    pub fn submit<F>(
        &self,
        payload: F,
        priority: Priority,
        dependencies: &[TaskId],
    ) -> Result<TaskHandle>
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        self.submit_with(payload, |task| {
            for dependency in dependencies {
                let dep = self.lookup(*dependency)?;
                self.shared.add_dependency(task, &dep)?;
            }
            let (resolver, handle) = channel(task.id.as_u64());
            self.shared
                .start_execution(task, priority, Some(resolver), Placement::Ready)?;
            Ok(handle)
        })
    }

    /// Register an anonymous task and queue it after `delay`
    pub fn submit_delayed<F>(
        &self,
        payload: F,
        priority: Priority,
        delay: Duration,
    ) -> Result<TaskHandle>
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        check_delay("delay", delay)?;
        self.submit_with(payload, |task| {
            let (resolver, handle) = channel(task.id.as_u64());
            self.shared.start_execution(
                task,
                priority,
                Some(resolver),
                Placement::Delayed(delay),
            )?;
            Ok(handle)
        })
    }

    /// Register an anonymous task run every `interval`. Cancel it through
    /// [`TaskHandle::task_id`].
    pub fn submit_periodic<F>(
        &self,
        payload: F,
        priority: Priority,
        interval: Duration,
    ) -> Result<TaskHandle>
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        check_delay("interval", interval)?;
        self.submit_with(payload, |task| {
            let (resolver, handle) = channel(task.id.as_u64());
            self.shared.start_execution(
                task,
                priority,
                Some(resolver),
                Placement::Periodic(interval),
            )?;
            Ok(handle)
        })
    }

    fn submit_with<F, S>(&self, payload: F, start: S) -> Result<TaskHandle>
    where
        F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
        S: FnOnce(&Arc<TaskInner>) -> Result<TaskHandle>,
    {
        if self.shared.is_shut_down() {
            return Err(TaskPoolError::Shutdown);
        }
        let task = self.shared.register(TaskInner::new(
            "anonymous",
            FnPayload::arc(payload),
            TaskType::Function,
        ));
        let result = start(&task);
        task.mark_released();
        self.shared.maybe_reclaim(&task);
        result
    }

    fn lookup(&self, id: TaskId) -> Result<Arc<TaskInner>> {
        self.shared
            .task(id)
            .ok_or_else(|| TaskPoolError::scheduling(format!("unknown task {}", id)))
    }

    /// Cancel a task by id. Cancelling a finished or already cancelled task
    /// is a no-op, including one whose record was already reclaimed.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        match self.shared.task(id) {
            Some(task) => self.shared.cancel_task(&task),
            // A reclaimed record has no execution left in flight
            None if id.was_issued() => {
                debug!("Cancel of reclaimed task {} ignored", id);
                Ok(())
            }
            None => Err(TaskPoolError::scheduling(format!("unknown task {}", id))),
        }
    }

    /// End a long-running task and free the worker that keeps it. A task
    /// that is still queued or running is cancelled.
    pub fn terminate_task(&self, task: &Task) -> Result<()> {
        self.shared.terminate_task(task.inner())
    }

    /// Make `task` wait for `dependency`
    pub fn add_dependency(&self, task: TaskId, dependency: TaskId) -> Result<()> {
        let task = self.lookup(task)?;
        let dependency = self.lookup(dependency)?;
        self.shared.add_dependency(&task, &dependency)
    }

    pub fn remove_dependency(&self, task: TaskId, dependency: TaskId) -> Result<()> {
        self.shared.remove_dependency(task, dependency)
    }

    pub fn task_group(&self, name: impl Into<String>) -> TaskGroup {
        let inner = Arc::new(GroupInner::new(name, Arc::downgrade(&self.shared)));
        self.shared.groups.lock().insert(inner.id, inner.clone());
        TaskGroup::new(inner)
    }

    /// A private sequence runner
    pub fn sequence_runner(&self, priority: Priority) -> SequenceRunner {
        let inner = Arc::new(RunnerInner::new(None, priority, Arc::downgrade(&self.shared)));
        self.shared.runners.lock().insert(inner.id, inner.clone());
        SequenceRunner::new(inner)
    }

    /// A named runner shared by everyone asking for the same name
    pub fn global_sequence_runner(
        &self,
        name: &str,
        priority: Priority,
    ) -> Result<SequenceRunner> {
        let mut named = self.shared.named_runners.lock();
        let mut runners = self.shared.runners.lock();
        if let Some(existing) = named.get(name).and_then(|id| runners.get(id)) {
            if existing.priority != priority {
                return Err(TaskPoolError::validation(format!(
                    "sequence runner '{}' exists with priority {}, requested {}",
                    name, existing.priority, priority
                )));
            }
            existing.add_holder();
            return Ok(SequenceRunner::new(existing.clone()));
        }

        let inner = Arc::new(RunnerInner::new(
            Some(name.to_string()),
            priority,
            Arc::downgrade(&self.shared),
        ));
        named.insert(name.to_string(), inner.id);
        runners.insert(inner.id, inner.clone());
        info!("Created global sequence runner '{}'", name);
        Ok(SequenceRunner::new(inner))
    }

    /// Locks usable from tasks and from any other thread
    pub fn locks(&self) -> LockManager {
        self.shared.locks.clone()
    }

    pub fn info(&self) -> PoolInfo {
        self.shared.info()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.task(id).map(|task| task.state())
    }

    /// Latest duration counter of a task, zero if unknown
    pub fn task_duration(&self, id: TaskId, kind: DurationKind) -> Duration {
        self.shared
            .durations
            .get(&id)
            .map(|entry| entry.value().get(kind))
            .unwrap_or(Duration::ZERO)
    }

    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().pool_size()
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().queues.len()
    }

    /// Pause dispatch and shrinking. Running tasks are not interrupted.
    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::SeqCst) {
            info!("Task pool suspended");
        }
    }

    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::SeqCst) {
            info!("Task pool resumed");
            let mut st = self.shared.state.lock();
            self.shared.work_available.notify_all();
            while self.shared.try_expand_locked(&mut st) {}
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    /// Run one shrink pass now
    pub fn trigger_shrink(&self, step: usize) -> usize {
        self.shared.trigger_shrink(step)
    }

    pub fn add_event_handler(&self, handler: Box<dyn TaskEventHandler + Send + Sync>) {
        self.shared.host.add_handler(handler);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }
}

/// Delays and intervals must be non-zero and representable as a deadline
fn check_delay(what: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(TaskPoolError::validation(format!("{} must be non-zero", what)));
    }
    if Instant::now().checked_add(value).is_none() {
        return Err(TaskPoolError::validation(format!(
            "{} of {:?} is out of range",
            what, value
        )));
    }
    Ok(())
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
