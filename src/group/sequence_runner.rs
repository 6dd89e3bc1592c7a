//! Sequence runners: a strict FIFO chain where members run one at a time.

use crate::error::{Result, TaskPoolError};
use crate::scheduler::Shared;
use crate::scheduler::manager::Placement;
use crate::task::handle::channel;
use crate::task::record::TaskInner;
use crate::task::*;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub(crate) struct RunnerState {
    current: Option<TaskId>,
    queue: VecDeque<Arc<TaskInner>>,
    unregistered: bool,
}

pub(crate) struct RunnerInner {
    pub(crate) id: RunnerId,
    pub(crate) name: Option<String>,
    pub(crate) priority: Priority,
    shared: Weak<Shared>,
    state: ReentrantMutex<RefCell<RunnerState>>,
    holders: AtomicUsize,
}

impl RunnerInner {
    pub(crate) fn new(name: Option<String>, priority: Priority, shared: Weak<Shared>) -> Self {
        Self {
            id: RunnerId::next(),
            name,
            priority,
            shared,
            state: ReentrantMutex::new(RefCell::new(RunnerState {
                current: None,
                queue: VecDeque::new(),
                unregistered: false,
            })),
            holders: AtomicUsize::new(1),
        }
    }

    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<RunnerState>> {
        self.state.lock()
    }

    pub(crate) fn add_holder(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.lock().borrow().current
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock().borrow().queue.len()
    }

    pub(crate) fn execute(&self, task: &Arc<TaskInner>) -> Result<TaskHandle> {
        let shared = self.shared.upgrade().ok_or(TaskPoolError::Shutdown)?;
        let guard = self.lock();

        if task.is_long_running() || task.is_periodic() {
            return Err(TaskPoolError::validation(format!(
                "task {} is {:?} and cannot join a sequence runner",
                task.id,
                task.task_type()
            )));
        }
        if task.group_id().is_some() {
            return Err(TaskPoolError::validation(format!(
                "task {} belongs to a task group",
                task.id
            )));
        }
        let attached = match task.runner_id() {
            Some(id) if id == self.id => false,
            Some(other) => {
                return Err(TaskPoolError::validation(format!(
                    "task {} belongs to {}",
                    task.id, other
                )));
            }
            None => true,
        };
        if shared.has_dependencies(task.id) {
            return Err(TaskPoolError::validation(format!(
                "sequence member {} cannot have dependencies",
                task.id
            )));
        }

        if attached {
            task.set_runner(self.id);
            task.set_task_type(TaskType::SequenceMember);
        }
        let idle = guard.borrow().current.is_none();
        let placement = if idle { Placement::Ready } else { Placement::Held };
        let (resolver, handle) = channel(task.id.as_u64());
        if let Err(e) = shared.start_execution(task, self.priority, Some(resolver), placement) {
            if attached {
                task.clear_runner();
                task.set_task_type(TaskType::Plain);
            }
            return Err(e);
        }

        {
            let mut st = guard.borrow_mut();
            if idle {
                if task.state() != TaskState::Canceled {
                    st.current = Some(task.id);
                }
            } else {
                st.queue.push_back(task.clone());
            }
        }
        debug!(
            "Task {} submitted to {} ({} queued)",
            task.id,
            self.id,
            guard.borrow().queue.len()
        );
        Ok(handle)
    }

    /// A member finished, failed or was cancelled; start the next one
    pub(crate) fn on_member_done(&self, task: TaskId) {
        let guard = self.lock();
        {
            let mut st = guard.borrow_mut();
            if st.current != Some(task) {
                st.queue.retain(|queued| queued.id != task);
                drop(st);
                self.unregister_if_idle(&guard);
                return;
            }
            st.current = None;
        }

        let shared = self.shared.upgrade();
        loop {
            let next = {
                let mut st = guard.borrow_mut();
                if st.current.is_some() {
                    break;
                }
                match st.queue.pop_front() {
                    Some(next) if next.state() == TaskState::Waiting => {
                        st.current = Some(next.id);
                        next
                    }
                    Some(_) => continue,
                    None => break,
                }
            };
            debug!("{} advancing to task {}", self.id, next.id);
            if let Some(shared) = &shared {
                shared.dispatch_held(&next);
            }
            break;
        }
        self.unregister_if_idle(&guard);
    }

    /// Drop a queued member. Returns whether it was queued.
    pub(crate) fn remove_queued(&self, task: TaskId) -> bool {
        let guard = self.lock();
        let mut st = guard.borrow_mut();
        let before = st.queue.len();
        st.queue.retain(|queued| queued.id != task);
        st.queue.len() != before
    }

    pub(crate) fn drain_queued(&self) -> Vec<Arc<TaskInner>> {
        let guard = self.lock();
        let mut st = guard.borrow_mut();
        st.queue.drain(..).collect()
    }

    pub(crate) fn release_holder(&self) {
        let previous = self.holders.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "{} released more often than acquired", self.id);
        let guard = self.lock();
        self.unregister_if_idle(&guard);
    }

    fn unregister_if_idle(&self, guard: &ReentrantMutexGuard<'_, RefCell<RunnerState>>) {
        {
            let st = guard.borrow();
            if st.unregistered || st.current.is_some() || !st.queue.is_empty() {
                return;
            }
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut named = shared.named_runners.lock();
        if self.holders() > 0 {
            return;
        }
        guard.borrow_mut().unregistered = true;
        if let Some(name) = &self.name {
            named.remove(name);
        }
        shared.runners.lock().remove(&self.id);
        debug!("{} released", self.id);
    }
}

/// Runs its members one at a time in submission order.
///
/// Named runners obtained from
/// [`Scheduler::global_sequence_runner`](crate::Scheduler::global_sequence_runner)
/// are shared; each handle counts as one holder.
pub struct SequenceRunner {
    inner: Arc<RunnerInner>,
}

impl SequenceRunner {
    pub(crate) fn new(inner: Arc<RunnerInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> RunnerId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Task currently executing (or dispatched) on this runner
    pub fn current(&self) -> Option<TaskId> {
        self.inner.current()
    }

    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// Append a task to the chain. It starts right away when the runner is
    /// idle, otherwise after every earlier member has completed.
    pub fn execute(&self, task: &Task) -> Result<TaskHandle> {
        self.inner.execute(task.inner())
    }
}

impl Drop for SequenceRunner {
    fn drop(&mut self) {
        self.inner.release_holder();
    }
}
