//! Admission, dispatch bookkeeping, completion and cancellation.
//!
//! `Shared` is the state every worker, timer and handle points back to. Its
//! coarse `state` mutex guards the ready queues, the dependency tables and the
//! worker records together. Per-task state and reference counts are atomics on
//! the task record. Lock order is runner or group lock, then `state`, then a
//! task slot. Completion (`finalize`) always runs without `state` held.

use crate::config::PoolConfig;
use crate::error::{Result, TaskError, TaskPoolError};
use crate::group::sequence_runner::RunnerInner;
use crate::group::task_group::GroupInner;
use crate::locks::LockManager;
use crate::pool::{WorkerId, WorkerRecord};
use crate::scheduler::dependency::DependencyGraph;
use crate::scheduler::host::HostLoop;
use crate::scheduler::queue::ReadyQueues;
use crate::scheduler::timers::TimerQueue;
use crate::task::handle::Resolver;
use crate::task::record::TaskInner;
use crate::task::*;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything guarded by the manager mutex
pub(crate) struct ManagerState {
    pub(crate) queues: ReadyQueues,
    pub(crate) deps: DependencyGraph,
    pub(crate) workers: HashMap<WorkerId, WorkerRecord>,
    pub(crate) retiring: HashSet<WorkerId>,
}

impl ManagerState {
    pub(crate) fn pool_size(&self) -> usize {
        self.workers.len() - self.retiring.len()
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|(id, w)| w.state == crate::pool::WorkerState::Idle && !self.retiring.contains(id))
            .count()
    }

    pub(crate) fn has_busy_worker_above_idle(&self) -> bool {
        self.workers.values().any(WorkerRecord::is_busy_above_idle)
    }
}

/// Where a task goes once it enters WAITING or DELAYED
#[derive(Clone, Copy, Debug)]
pub(crate) enum Placement {
    /// Ready queue, or withheld while dependencies are pending
    Ready,
    /// Kept by a sequence runner until its turn
    Held,
    Delayed(Duration),
    Periodic(Duration),
}

/// Result of trying to put a WAITING task on the ready queue
enum Admission {
    Queued,
    Withheld,
    Rejected(TaskError),
}

pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) work_available: Condvar,
    pub(crate) tasks: DashMap<TaskId, Arc<TaskInner>>,
    pub(crate) durations: DashMap<TaskId, TaskDurations>,
    pub(crate) groups: Mutex<HashMap<GroupId, Arc<GroupInner>>>,
    pub(crate) runners: Mutex<HashMap<RunnerId, Arc<RunnerInner>>>,
    pub(crate) named_runners: Mutex<HashMap<String, RunnerId>>,
    pub(crate) timers: TimerQueue,
    pub(crate) host: HostLoop,
    pub(crate) locks: LockManager,
    pub(crate) shut_down: AtomicBool,
    pub(crate) suspended: AtomicBool,
    pub(crate) monitor_stop: Mutex<bool>,
    pub(crate) monitor_wake: Condvar,
    pub(crate) monitor_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) self_ref: Weak<Shared>,
}

impl Shared {
    pub(crate) fn new(config: PoolConfig, self_ref: Weak<Shared>) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState {
                queues: ReadyQueues::new(),
                deps: DependencyGraph::new(),
                workers: HashMap::new(),
                retiring: HashSet::new(),
            }),
            work_available: Condvar::new(),
            tasks: DashMap::new(),
            durations: DashMap::new(),
            groups: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            named_runners: Mutex::new(HashMap::new()),
            timers: TimerQueue::new(),
            host: HostLoop::new(),
            locks: LockManager::new(),
            shut_down: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            monitor_stop: Mutex::new(false),
            monitor_wake: Condvar::new(),
            monitor_thread: Mutex::new(None),
            self_ref,
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn task(&self, id: TaskId) -> Option<Arc<TaskInner>> {
        self.tasks.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn group(&self, id: GroupId) -> Option<Arc<GroupInner>> {
        self.groups.lock().get(&id).cloned()
    }

    pub(crate) fn runner(&self, id: RunnerId) -> Option<Arc<RunnerInner>> {
        self.runners.lock().get(&id).cloned()
    }

    /// Add a freshly built record to the registry
    pub(crate) fn register(&self, task: TaskInner) -> Arc<TaskInner> {
        let task = Arc::new(task);
        self.tasks.insert(task.id, task.clone());
        debug!("Registered task {} ({})", task.id, task.name);
        task
    }

    pub(crate) fn has_dependencies(&self, id: TaskId) -> bool {
        self.state.lock().deps.has_edges(id)
    }

    /// Move a task into WAITING (or DELAYED) for a new execution and place it.
    ///
    /// Only NOT_FOUND and FINISHED tasks can start an execution. On success the
    /// execution holds one reference count until it is finalized.
    pub(crate) fn start_execution(
        &self,
        task: &Arc<TaskInner>,
        priority: Priority,
        resolver: Option<Resolver<TaskValue>>,
        placement: Placement,
    ) -> Result<()> {
        if self.is_shut_down() {
            return Err(TaskPoolError::Shutdown);
        }

        let mut st = self.state.lock();
        let from = task.state();
        if !matches!(from, TaskState::NotFound | TaskState::Finished) {
            return Err(TaskPoolError::validation(format!(
                "task {} is {} and cannot be executed",
                task.id, from
            )));
        }
        if task.is_long_running() && from == TaskState::Finished {
            return Err(TaskPoolError::validation(format!(
                "long-running task {} can only run once",
                task.id
            )));
        }
        if let Placement::Periodic(_) = placement {
            if st.deps.has_edges(task.id) {
                return Err(TaskPoolError::validation(format!(
                    "periodic task {} cannot have dependencies",
                    task.id
                )));
            }
        }

        let target = match placement {
            Placement::Ready | Placement::Held => TaskState::Waiting,
            Placement::Delayed(_) | Placement::Periodic(_) => TaskState::Delayed,
        };
        task.transition(from, target).map_err(|observed| {
            TaskPoolError::validation(format!(
                "task {} changed state to {} concurrently",
                task.id, observed
            ))
        })?;

        let timer = match placement {
            Placement::Delayed(delay) => self.timers.schedule(task.id, delay, None),
            Placement::Periodic(interval) => self.timers.schedule(task.id, interval, Some(interval)),
            _ => None,
        };
        if matches!(placement, Placement::Delayed(_) | Placement::Periodic(_)) && timer.is_none() {
            task.set_state(from);
            return Err(TaskPoolError::Shutdown);
        }
        if let Placement::Periodic(_) = placement {
            task.set_task_type(TaskType::Periodic);
        }

        {
            let mut slot = task.slot.lock();
            slot.priority = priority;
            slot.resolver = resolver;
            slot.enqueued_at = Some(Instant::now());
            slot.timer = timer;
            slot.interval = match placement {
                Placement::Periodic(interval) => Some(interval),
                _ => None,
            };
        }
        task.retain();

        let rejected = match placement {
            Placement::Ready => self.admit_locked(&mut st, task),
            _ => Admission::Withheld,
        };
        if let Admission::Rejected(_) = rejected {
            task.set_state(TaskState::Canceled);
        }
        // Timed placements report the enqueue when their timer fires. Posted
        // before any worker can report the start.
        if matches!(placement, Placement::Ready | Placement::Held) {
            self.notify_enqueued(task, priority);
        }
        drop(st);

        debug!(
            "Task {} accepted with priority {} ({:?})",
            task.id, priority, placement
        );
        if let Admission::Rejected(reason) = rejected {
            self.finalize(task, Err(reason), None);
        }
        Ok(())
    }

    /// Put a WAITING task on its lane unless dependencies hold it back
    fn admit_locked(&self, st: &mut ManagerState, task: &Arc<TaskInner>) -> Admission {
        if self.is_shut_down() {
            return Admission::Rejected(TaskError::Shutdown);
        }
        if let Some(dependency) = st.deps.take_failure(task.id) {
            return Admission::Rejected(TaskError::DependencyFailed { dependency });
        }
        if st.deps.has_pending(task.id) {
            st.deps.withhold(task.id);
            debug!(
                "Task {} withheld until {:?} finish",
                task.id,
                st.deps.dependencies_of(task.id)
            );
            return Admission::Withheld;
        }
        self.push_ready_locked(st, task);
        Admission::Queued
    }

    fn push_ready_locked(&self, st: &mut ManagerState, task: &Arc<TaskInner>) {
        let priority = {
            let mut slot = task.slot.lock();
            slot.enqueued_at = Some(Instant::now());
            slot.priority
        };
        st.queues.push(priority, task.id);
        self.work_available.notify_one();
        self.try_expand_locked(st);
    }

    /// Admit a task a sequence runner held back. Called with the runner lock held.
    pub(crate) fn dispatch_held(&self, task: &Arc<TaskInner>) {
        let mut st = self.state.lock();
        if task.state() != TaskState::Waiting {
            return;
        }
        let admission = self.admit_locked(&mut st, task);
        if let Admission::Rejected(_) = admission {
            task.set_state(TaskState::Canceled);
        }
        drop(st);
        if let Admission::Rejected(reason) = admission {
            self.finalize(task, Err(reason), None);
        }
    }

    /// Timer expiry for a delayed task or one periodic tick
    pub(crate) fn on_timer(&self, id: TaskId) {
        let Some(task) = self.task(id) else {
            return;
        };
        let mut st = self.state.lock();
        if self.is_shut_down() {
            return;
        }
        if task.transition(TaskState::Delayed, TaskState::Waiting).is_err() {
            debug!(
                "Timer tick for task {} skipped, task is {}",
                id,
                task.state()
            );
            return;
        }
        let priority = {
            let mut slot = task.slot.lock();
            if !task.is_periodic() {
                slot.timer = None;
            }
            slot.priority
        };
        self.notify_enqueued(&task, priority);
        let admission = self.admit_locked(&mut st, &task);
        if let Admission::Rejected(_) = admission {
            task.set_state(TaskState::Canceled);
        }
        drop(st);
        if let Admission::Rejected(reason) = admission {
            if let Some(timer) = task.slot.lock().timer.take() {
                self.timers.cancel(timer);
            }
            self.finalize(&task, Err(reason), None);
        }
    }

    /// Pop the next dispatchable task for a worker, moving it to RUNNING
    pub(crate) fn dequeue_locked(&self, st: &mut ManagerState) -> Option<Arc<TaskInner>> {
        let allow_idle = !self.config.idle_priority_guard || !st.has_busy_worker_above_idle();
        while let Some(id) = st.queues.pop(allow_idle) {
            let Some(task) = self.task(id) else {
                continue;
            };
            if task.transition(TaskState::Waiting, TaskState::Running).is_ok() {
                return Some(task);
            }
            debug!("Dropping stale queue entry for task {}", id);
        }
        None
    }

    /// A worker returned from a task body
    pub(crate) fn complete(
        &self,
        task: &Arc<TaskInner>,
        outcome: TaskOutcome,
        queued: Duration,
        cpu: Duration,
    ) {
        let io_start = Instant::now();
        if task.is_periodic() {
            match task.transition(TaskState::Running, TaskState::Delayed) {
                Ok(()) => {
                    self.finish_iteration(task, outcome, queued, cpu, io_start);
                    return;
                }
                Err(observed) => {
                    debug!(
                        "Periodic task {} ended while {}, dropping its result",
                        task.id, observed
                    );
                    task.set_state(TaskState::Canceled);
                    self.finalize(task, Err(TaskError::Canceled), Some((queued, cpu, io_start)));
                    return;
                }
            }
        }

        let outcome = match task.transition(TaskState::Running, TaskState::Finished) {
            Ok(()) => outcome,
            Err(observed) => {
                debug!(
                    "Task {} was {} while running, dropping its result",
                    task.id, observed
                );
                Err(TaskError::Canceled)
            }
        };
        self.finalize(task, outcome, Some((queued, cpu, io_start)));
    }

    fn finish_iteration(
        &self,
        task: &Arc<TaskInner>,
        outcome: TaskOutcome,
        queued: Duration,
        cpu: Duration,
        io_start: Instant,
    ) {
        let sink = {
            let mut slot = task.slot.lock();
            slot.last_success = Some(outcome.is_ok());
            slot.sink.clone()
        };
        self.notify_outcome(task.id, &outcome, sink);
        self.record_durations(task.id, queued, cpu, io_start);
    }

    /// Terminal bookkeeping of one execution: telemetry, listeners,
    /// dependents, the owning group or runner, the handle, and the
    /// reference count.
    pub(crate) fn finalize(
        &self,
        task: &Arc<TaskInner>,
        outcome: TaskOutcome,
        timing: Option<(Duration, Duration, Instant)>,
    ) {
        let (resolver, sink) = {
            let mut slot = task.slot.lock();
            slot.last_success = Some(outcome.is_ok());
            slot.enqueued_at = None;
            if let Some(timer) = slot.timer.take() {
                self.timers.cancel(timer);
            }
            (slot.resolver.take(), slot.sink.clone())
        };

        self.notify_outcome(task.id, &outcome, sink);

        if outcome.is_ok() {
            self.resolve_dependents(task.id);
        } else {
            self.fail_dependents(task.id);
        }

        if let Some(group) = task.group_id().and_then(|id| self.group(id)) {
            group.on_member_done(task.id, &outcome);
        }
        if let Some(runner) = task.runner_id().and_then(|id| self.runner(id)) {
            runner.on_member_done(task.id);
        }

        if let Some((queued, cpu, io_start)) = timing {
            self.record_durations(task.id, queued, cpu, io_start);
        }
        if let Some(resolver) = resolver {
            resolver.resolve(outcome);
        }

        task.release_ref();
        self.maybe_reclaim(task);
    }

    fn record_durations(&self, id: TaskId, queued: Duration, cpu: Duration, io_start: Instant) {
        self.durations.insert(
            id,
            TaskDurations {
                queued,
                cpu,
                io: io_start.elapsed(),
            },
        );
    }

    fn notify_enqueued(&self, task: &TaskInner, priority: Priority) {
        if let Some(sink) = task.slot.lock().sink.clone() {
            let id = task.id;
            self.host.post(move || sink.on_enqueued(id));
        }
        self.host.emit(TaskEvent::TaskEnqueued {
            task_id: task.id,
            priority,
        });
    }

    pub(crate) fn notify_started(&self, task: &TaskInner, worker_id: WorkerId) {
        if let Some(sink) = task.slot.lock().sink.clone() {
            let id = task.id;
            self.host.post(move || sink.on_start_execution(id));
        }
        self.host.emit(TaskEvent::TaskStarted {
            task_id: task.id,
            worker_id,
            started_at: chrono::Utc::now(),
        });
    }

    fn notify_outcome(
        &self,
        id: TaskId,
        outcome: &TaskOutcome,
        sink: Option<Arc<dyn CompletionSink>>,
    ) {
        match outcome {
            Ok(value) => {
                if let Some(sink) = sink {
                    let value = value.clone();
                    self.host
                        .post(move || sink.on_execution_succeeded(id, &value));
                }
                self.host.emit(TaskEvent::TaskSucceeded {
                    task_id: id,
                    finished_at: chrono::Utc::now(),
                });
            }
            Err(error) if error.is_cancellation() => {
                self.host.emit(TaskEvent::TaskCanceled {
                    task_id: id,
                    reason: error.clone(),
                });
            }
            Err(error) => {
                if let Some(sink) = sink {
                    let error = error.clone();
                    self.host.post(move || sink.on_execution_failed(id, &error));
                }
                self.host.emit(TaskEvent::TaskFailed {
                    task_id: id,
                    error: error.clone(),
                });
            }
        }
    }

    /// Admit every withheld dependent whose last dependency was `done`
    fn resolve_dependents(&self, done: TaskId) {
        let mut rejected = Vec::new();
        {
            let mut st = self.state.lock();
            for id in st.deps.resolve(done) {
                let Some(task) = self.task(id) else {
                    continue;
                };
                if task.state() != TaskState::Waiting {
                    continue;
                }
                debug!("Dependencies of task {} resolved", id);
                if self.is_shut_down() {
                    task.set_state(TaskState::Canceled);
                    rejected.push(task);
                } else {
                    self.push_ready_locked(&mut st, &task);
                }
            }
        }
        for task in rejected {
            self.finalize(&task, Err(TaskError::Shutdown), None);
        }
    }

    /// Reject the withheld dependents of a task that did not succeed
    fn fail_dependents(&self, failed: TaskId) {
        let rejected: Vec<Arc<TaskInner>> = {
            let mut st = self.state.lock();
            st.deps
                .fail(failed)
                .into_iter()
                .filter_map(|id| self.task(id))
                .filter(|task| {
                    task.transition(TaskState::Waiting, TaskState::Canceled)
                        .is_ok()
                })
                .collect()
        };
        for task in rejected {
            info!(
                "Rejecting task {}: dependency {} did not finish successfully",
                task.id, failed
            );
            self.finalize(
                &task,
                Err(TaskError::DependencyFailed { dependency: failed }),
                None,
            );
        }
    }

    /// Cancel one task according to its current state
    pub(crate) fn cancel_task(&self, task: &Arc<TaskInner>) -> Result<()> {
        let runner = task.runner_id().and_then(|id| self.runner(id));
        let _runner_guard = runner.as_ref().map(|runner| runner.lock());

        let finalize_now = {
            let mut st = self.state.lock();
            loop {
                let state = task.state();
                match state {
                    TaskState::NotFound => {
                        return Err(TaskPoolError::scheduling(format!(
                            "task {} has not been executed",
                            task.id
                        )));
                    }
                    TaskState::Finished | TaskState::Canceled | TaskState::Ending => {
                        return Ok(());
                    }
                    TaskState::Delayed => {
                        if task.transition(state, TaskState::Canceled).is_err() {
                            continue;
                        }
                        self.disarm(task);
                        st.deps.forget(task.id);
                        break true;
                    }
                    TaskState::Waiting => {
                        if task.transition(state, TaskState::Canceled).is_err() {
                            continue;
                        }
                        self.disarm(task);
                        let queued = st.queues.remove(task.id);
                        let withheld = st.deps.release_withheld(task.id);
                        st.deps.forget(task.id);
                        if !queued && !withheld {
                            if let Some(runner) = &runner {
                                runner.remove_queued(task.id);
                            }
                        }
                        break true;
                    }
                    TaskState::Running => {
                        let target = if task.is_periodic() {
                            TaskState::Ending
                        } else {
                            TaskState::Canceled
                        };
                        if task.transition(state, target).is_err() {
                            continue;
                        }
                        self.disarm(task);
                        break false;
                    }
                }
            }
        };

        info!("Canceled task {}", task.id);
        if finalize_now {
            self.finalize(task, Err(TaskError::Canceled), None);
        }
        Ok(())
    }

    /// Release a long-running task from the worker that ran it, cancelling
    /// the task first when it has not ended yet. The worker may then be
    /// retired by the next shrink pass.
    pub(crate) fn terminate_task(&self, task: &Arc<TaskInner>) -> Result<()> {
        if !task.is_long_running() {
            return Err(TaskPoolError::validation(format!(
                "task {} is not long-running",
                task.id
            )));
        }
        match task.state() {
            TaskState::NotFound => {
                return Err(TaskPoolError::scheduling(format!(
                    "task {} has not been executed",
                    task.id
                )));
            }
            TaskState::Waiting | TaskState::Delayed | TaskState::Running => {
                self.cancel_task(task)?;
            }
            TaskState::Finished | TaskState::Canceled | TaskState::Ending => {}
        }

        let holder = {
            let mut st = self.state.lock();
            st.workers
                .iter_mut()
                .find_map(|(id, record)| record.long_tasks.remove(&task.id).then_some(*id))
        };
        match holder {
            Some(worker) => info!("Terminated long task {} on worker {}", task.id, worker),
            None => debug!("Long task {} holds no worker", task.id),
        }
        Ok(())
    }

    fn disarm(&self, task: &TaskInner) {
        if let Some(timer) = task.slot.lock().timer.take() {
            self.timers.cancel(timer);
        }
    }

    pub(crate) fn add_dependency(&self, task: &Arc<TaskInner>, dependency: &Arc<TaskInner>) -> Result<()> {
        for (role, t) in [("task", task), ("dependency", dependency)] {
            if !t.is_unowned() {
                return Err(TaskPoolError::validation(format!(
                    "{} {} belongs to a group or sequence runner",
                    role, t.id
                )));
            }
            if t.is_periodic() {
                return Err(TaskPoolError::validation(format!(
                    "{} {} is periodic",
                    role, t.id
                )));
            }
        }
        if task.is_long_running() {
            return Err(TaskPoolError::validation(format!(
                "long-running task {} cannot have dependencies",
                task.id
            )));
        }

        let mut st = self.state.lock();
        if !matches!(
            task.state(),
            TaskState::NotFound | TaskState::Finished | TaskState::Delayed
        ) {
            return Err(TaskPoolError::validation(format!(
                "task {} is {} and cannot gain dependencies",
                task.id,
                task.state()
            )));
        }
        let last_success = dependency.slot.lock().last_success;
        match (dependency.state(), last_success) {
            (TaskState::Finished, Some(true)) => {
                debug!(
                    "Dependency {} of task {} already finished",
                    dependency.id, task.id
                );
                Ok(())
            }
            (TaskState::Finished, Some(false)) | (TaskState::Canceled, _) => {
                Err(TaskPoolError::validation(format!(
                    "dependency {} did not finish successfully",
                    dependency.id
                )))
            }
            _ => {
                st.deps.add(task.id, dependency.id)?;
                debug!("Task {} now depends on {}", task.id, dependency.id);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_dependency(&self, task: TaskId, dependency: TaskId) -> Result<()> {
        let mut st = self.state.lock();
        if !st.deps.remove(task, dependency) {
            return Err(TaskPoolError::scheduling(format!(
                "no dependency to remove between {} and {}",
                task, dependency
            )));
        }
        if st.deps.take_if_ready(task) {
            if let Some(task) = self.task(task) {
                self.push_ready_locked(&mut st, &task);
            }
        }
        Ok(())
    }

    /// Reclaim a record once nothing references it any more
    pub(crate) fn maybe_reclaim(&self, task: &Arc<TaskInner>) {
        if !task.try_claim_reclaim() {
            return;
        }
        let removed = self.tasks.remove(&task.id);
        assert!(
            removed.is_some(),
            "task {} reclaimed more than once",
            task.id
        );
        self.durations.remove(&task.id);
        self.state.lock().deps.forget(task.id);
        debug!("Reclaimed task {}", task.id);
    }

    /// Spawn a worker if queued work exceeds idle capacity. Suspended pools
    /// do not grow.
    pub(crate) fn try_expand_locked(&self, st: &mut ManagerState) -> bool {
        if self.is_shut_down() || self.is_suspended() {
            return false;
        }
        let allow_idle = !self.config.idle_priority_guard || !st.has_busy_worker_above_idle();
        let dispatchable = st.queues.dispatchable(allow_idle);
        if dispatchable > st.idle_workers() && st.pool_size() < self.config.max_workers {
            return self.spawn_worker_locked(st).is_some();
        }
        false
    }

    /// Reject everything still waiting with a shutdown error and join the
    /// threads. Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down task pool");

        self.stop_monitor();
        let mut pending: Vec<TaskId> = self.timers.stop();

        let runners: Vec<Arc<RunnerInner>> = self.runners.lock().values().cloned().collect();
        let mut rejected: Vec<Arc<TaskInner>> = Vec::new();
        for runner in runners {
            rejected.extend(
                runner
                    .drain_queued()
                    .into_iter()
                    .filter(|task| task.transition(TaskState::Waiting, TaskState::Canceled).is_ok()),
            );
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut st = self.state.lock();
            pending.extend(st.queues.drain());
            for id in st.deps.withheld_tasks() {
                st.deps.release_withheld(id);
                pending.push(id);
            }
            for id in pending {
                let Some(task) = self.task(id) else {
                    continue;
                };
                let state = task.state();
                if matches!(state, TaskState::Waiting | TaskState::Delayed)
                    && task.transition(state, TaskState::Canceled).is_ok()
                {
                    rejected.push(task);
                }
            }
            self.work_available.notify_all();
            st.workers
                .values_mut()
                .filter_map(|worker| worker.handle.take())
                .collect()
        };

        if !rejected.is_empty() {
            info!("Rejecting {} pending tasks on shutdown", rejected.len());
        }
        for task in rejected {
            self.finalize(&task, Err(TaskError::Shutdown), None);
        }

        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        self.state.lock().workers.clear();
        self.host.stop();
        info!("Task pool shut down");
    }
}
