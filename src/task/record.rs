//! Task records.
//!
//! Every task lives in the scheduler registry as an `Arc<TaskInner>`. The
//! record carries an explicit in-flight counter (`ref_count`) next to the
//! `Arc`: each pending execution and each owning group holds one count. A
//! record is reclaimed from the registry exactly once, when the counter is zero
//! and every external [`Task`] handle has been dropped.

use crate::error::{Result, TaskPoolError};
use crate::scheduler::Shared;
use crate::scheduler::timers::TimerId;
use crate::task::handle::Resolver;
use crate::task::listener::CompletionSink;
use crate::task::payload::{Payload, TaskContext};
use crate::task::types::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Mutable per-execution data of a task
pub(crate) struct ExecutionSlot {
    pub(crate) priority: Priority,
    pub(crate) resolver: Option<Resolver<TaskValue>>,
    pub(crate) sink: Option<Arc<dyn CompletionSink>>,
    pub(crate) timer: Option<TimerId>,
    pub(crate) interval: Option<Duration>,
    pub(crate) enqueued_at: Option<Instant>,
    /// Whether the latest completed execution succeeded
    pub(crate) last_success: Option<bool>,
}

pub(crate) struct TaskInner {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    payload: Arc<dyn Payload>,
    long_running: bool,
    kind: AtomicTaskType,
    state: AtomicTaskState,
    ref_count: AtomicU32,
    released: AtomicBool,
    reclaimed: AtomicBool,
    group: AtomicU64,
    runner: AtomicU64,
    pub(crate) slot: Mutex<ExecutionSlot>,
}

impl TaskInner {
    pub(crate) fn new(
        name: impl Into<String>,
        payload: Arc<dyn Payload>,
        kind: TaskType,
    ) -> Self {
        Self {
            id: TaskId::next(),
            name: name.into(),
            payload,
            long_running: kind == TaskType::LongRunning,
            kind: AtomicTaskType::new(kind),
            state: AtomicTaskState::new(TaskState::NotFound),
            ref_count: AtomicU32::new(0),
            released: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            group: AtomicU64::new(0),
            runner: AtomicU64::new(0),
            slot: Mutex::new(ExecutionSlot {
                priority: Priority::default(),
                resolver: None,
                sink: None,
                timer: None,
                interval: None,
                enqueued_at: None,
                last_success: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state);
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> std::result::Result<(), TaskState> {
        self.state.transition(from, to)
    }

    pub(crate) fn task_type(&self) -> TaskType {
        self.kind.load()
    }

    pub(crate) fn set_task_type(&self, kind: TaskType) {
        self.kind.store(kind);
    }

    pub(crate) fn is_long_running(&self) -> bool {
        self.long_running
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.task_type() == TaskType::Periodic
    }

    pub(crate) fn priority(&self) -> Priority {
        self.slot.lock().priority
    }

    pub(crate) fn group_id(&self) -> Option<GroupId> {
        match self.group.load(Ordering::Acquire) {
            0 => None,
            raw => Some(GroupId::from_raw(raw)),
        }
    }

    pub(crate) fn set_group(&self, group: GroupId) {
        self.group.store(group.as_u64(), Ordering::Release);
    }

    pub(crate) fn runner_id(&self) -> Option<RunnerId> {
        match self.runner.load(Ordering::Acquire) {
            0 => None,
            raw => Some(RunnerId::from_raw(raw)),
        }
    }

    pub(crate) fn set_runner(&self, runner: RunnerId) {
        self.runner.store(runner.as_u64(), Ordering::Release);
    }

    pub(crate) fn clear_runner(&self) {
        self.runner.store(0, Ordering::Release);
    }

    /// Whether the task may still be attached to a group or runner
    pub(crate) fn is_unowned(&self) -> bool {
        self.group_id().is_none() && self.runner_id().is_none()
    }

    pub(crate) fn invoke(&self, ctx: &TaskContext) -> anyhow::Result<TaskValue> {
        self.payload.invoke(ctx)
    }

    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one in-flight count and return the remaining count
    pub(crate) fn release_ref(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            panic!("reference count of task {} dropped below zero", self.id);
        }
        previous - 1
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Claim the right to reclaim this record. Succeeds for exactly one caller.
    pub(crate) fn try_claim_reclaim(&self) -> bool {
        if !self.released.load(Ordering::SeqCst) || self.ref_count() != 0 {
            return false;
        }
        self.reclaimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A task constructed by the caller.
///
/// Cloning is cheap and yields another handle to the same task. The record is
/// reclaimed once every clone is dropped and no execution is in flight.
#[derive(Clone)]
pub struct Task {
    handle: Arc<TaskRef>,
}

struct TaskRef {
    inner: Arc<TaskInner>,
    shared: Weak<Shared>,
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        self.inner.mark_released();
        if let Some(shared) = self.shared.upgrade() {
            shared.maybe_reclaim(&self.inner);
        }
    }
}

impl Task {
    pub(crate) fn new(inner: Arc<TaskInner>, shared: Weak<Shared>) -> Self {
        Self {
            handle: Arc::new(TaskRef { inner, shared }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<TaskInner> {
        &self.handle.inner
    }

    pub fn id(&self) -> TaskId {
        self.handle.inner.id
    }

    pub fn name(&self) -> &str {
        &self.handle.inner.name
    }

    pub fn state(&self) -> TaskState {
        self.handle.inner.state()
    }

    pub fn task_type(&self) -> TaskType {
        self.handle.inner.task_type()
    }

    /// Priority of the latest execution
    pub fn priority(&self) -> Priority {
        self.handle.inner.priority()
    }

    pub fn is_long_running(&self) -> bool {
        self.handle.inner.is_long_running()
    }

    /// Whether the latest execution has ended, successfully or not
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.handle.inner.group_id()
    }

    pub fn runner_id(&self) -> Option<RunnerId> {
        self.handle.inner.runner_id()
    }

    /// Attach the lifecycle callbacks. Only allowed while the task is not
    /// queued, delayed or running.
    pub fn set_completion_sink(&self, sink: Arc<dyn CompletionSink>) -> Result<()> {
        let inner = &self.handle.inner;
        match inner.state() {
            TaskState::NotFound | TaskState::Finished => {
                inner.slot.lock().sink = Some(sink);
                Ok(())
            }
            other => Err(TaskPoolError::validation(format!(
                "cannot attach a completion sink to task {} while it is {}",
                inner.id, other
            ))),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("type", &self.task_type())
            .finish()
    }
}
