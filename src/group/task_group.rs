//! Task groups: an ordered batch of tasks executed together.
//!
//! Each `execute` call creates one execution with a result slot per member.
//! Only one execution is current at a time; later calls queue behind it and
//! start when the current one resolves.

use crate::error::{Result, TaskError, TaskPoolError};
use crate::scheduler::Shared;
use crate::scheduler::manager::Placement;
use crate::task::handle::{Resolver, channel};
use crate::task::record::TaskInner;
use crate::task::*;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

struct GroupExecution {
    priority: Priority,
    results: Vec<Option<TaskOutcome>>,
    finished: usize,
    resolver: Resolver<Vec<TaskOutcome>>,
}

impl GroupExecution {
    fn new(priority: Priority, members: usize, resolver: Resolver<Vec<TaskOutcome>>) -> Self {
        Self {
            priority,
            results: vec![None; members],
            finished: 0,
            resolver,
        }
    }
}

struct GroupState {
    status: TaskState,
    members: Vec<Arc<TaskInner>>,
    current: Option<GroupExecution>,
    pending: VecDeque<GroupExecution>,
    released: bool,
    unregistered: bool,
}

pub(crate) struct GroupInner {
    pub(crate) id: GroupId,
    name: String,
    shared: Weak<Shared>,
    state: ReentrantMutex<RefCell<GroupState>>,
}

impl GroupInner {
    pub(crate) fn new(name: impl Into<String>, shared: Weak<Shared>) -> Self {
        Self {
            id: GroupId::next(),
            name: name.into(),
            shared,
            state: ReentrantMutex::new(RefCell::new(GroupState {
                status: TaskState::NotFound,
                members: Vec::new(),
                current: None,
                pending: VecDeque::new(),
                released: false,
                unregistered: false,
            })),
        }
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(TaskPoolError::Shutdown)
    }

    pub(crate) fn status(&self) -> TaskState {
        self.state.lock().borrow().status
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().borrow().members.len()
    }

    pub(crate) fn add_task(&self, task: &Arc<TaskInner>) -> Result<()> {
        let shared = self.shared()?;
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.status != TaskState::NotFound {
            return Err(TaskPoolError::validation(format!(
                "tasks can only be added to {} before its first execution",
                self.id
            )));
        }
        if task.state() != TaskState::NotFound {
            return Err(TaskPoolError::validation(format!(
                "task {} has already been executed",
                task.id
            )));
        }
        if !task.is_unowned() {
            return Err(TaskPoolError::validation(format!(
                "task {} already belongs to a group or sequence runner",
                task.id
            )));
        }
        if task.is_long_running() || task.is_periodic() {
            return Err(TaskPoolError::validation(format!(
                "task {} is {:?} and cannot join a group",
                task.id,
                task.task_type()
            )));
        }
        if shared.has_dependencies(task.id) {
            return Err(TaskPoolError::validation(format!(
                "task {} has dependencies and cannot join a group",
                task.id
            )));
        }

        task.set_group(self.id);
        task.set_task_type(TaskType::GroupMember);
        task.retain();
        st.members.push(task.clone());
        debug!("Added task {} to {} ({})", task.id, self.id, self.name);
        Ok(())
    }

    pub(crate) fn execute(&self, priority: Priority) -> Result<GroupHandle> {
        let shared = self.shared()?;
        if shared.is_shut_down() {
            return Err(TaskPoolError::Shutdown);
        }
        let guard = self.state.lock();
        let (resolver, handle) = channel(self.id.as_u64());
        {
            let mut st = guard.borrow_mut();
            if st.status == TaskState::Canceled {
                return Err(TaskPoolError::validation(format!(
                    "{} has been canceled",
                    self.id
                )));
            }
            if st.members.is_empty() {
                st.status = TaskState::Finished;
                resolver.resolve(Ok(Vec::new()));
                return Ok(handle);
            }
            let execution = GroupExecution::new(priority, st.members.len(), resolver);
            if st.current.is_some() {
                st.pending.push_back(execution);
                debug!("Queued execution of {} behind the current one", self.id);
                return Ok(handle);
            }
            st.current = Some(execution);
            st.status = TaskState::Waiting;
        }
        info!("Executing {} ({}) with priority {}", self.id, self.name, priority);
        self.start_current(&shared);
        Ok(handle)
    }

    /// Admit every member for the current execution
    fn start_current(&self, shared: &Shared) {
        let guard = self.state.lock();
        let (members, priority) = {
            let st = guard.borrow();
            let Some(current) = st.current.as_ref() else {
                return;
            };
            (st.members.clone(), current.priority)
        };
        for member in &members {
            let admitted = if member.state() == TaskState::Canceled {
                Err(TaskError::Canceled)
            } else {
                shared
                    .start_execution(member, priority, None, Placement::Ready)
                    .map_err(|e| match e {
                        TaskPoolError::Shutdown => TaskError::Shutdown,
                        other => TaskError::Execution {
                            message: other.to_string(),
                        },
                    })
            };
            if let Err(error) = admitted {
                self.on_member_done(member.id, &Err(error));
            }
        }
    }

    pub(crate) fn mark_running(&self) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.status == TaskState::Waiting {
            st.status = TaskState::Running;
        }
    }

    /// Record a member outcome; resolves the execution when it was the last one
    pub(crate) fn on_member_done(&self, task: TaskId, outcome: &TaskOutcome) {
        let guard = self.state.lock();
        let finished = {
            let mut st = guard.borrow_mut();
            let Some(index) = st.members.iter().position(|member| member.id == task) else {
                return;
            };
            let member_count = st.members.len();
            let Some(current) = st.current.as_mut() else {
                return;
            };
            if current.results[index].is_some() {
                return;
            }
            current.results[index] = Some(outcome.clone());
            current.finished += 1;
            if current.finished < member_count {
                return;
            }
            let execution = st.current.take();
            if st.status != TaskState::Canceled {
                st.status = TaskState::Finished;
            }
            execution
        };

        if let Some(execution) = finished {
            if matches!(outcome, Err(TaskError::Canceled)) {
                info!("Last pending member of {} was canceled", self.id);
                execution.resolver.resolve(Err(TaskError::GroupCanceled));
            } else {
                let results = execution
                    .results
                    .into_iter()
                    .map(|result| result.unwrap_or(Err(TaskError::Canceled)))
                    .collect();
                info!("{} finished", self.id);
                execution.resolver.resolve(Ok(results));
            }
        }

        let next_started = {
            let mut st = guard.borrow_mut();
            match st.pending.pop_front() {
                Some(next) if st.status != TaskState::Canceled => {
                    st.current = Some(next);
                    st.status = TaskState::Waiting;
                    true
                }
                _ => false,
            }
        };
        if next_started {
            if let Some(shared) = self.shared.upgrade() {
                self.start_current(&shared);
            }
        } else if guard.borrow().released {
            self.unregister();
        }
    }

    /// Cancel the whole group: pending executions, the current execution and
    /// every unfinished member. A cancelled group cannot run again.
    pub(crate) fn cancel(&self) -> Result<()> {
        let shared = self.shared()?;
        let guard = self.state.lock();
        let (executions, members) = {
            let mut st = guard.borrow_mut();
            match st.status {
                TaskState::NotFound => {
                    return Err(TaskPoolError::scheduling(format!(
                        "{} has not been executed",
                        self.id
                    )));
                }
                TaskState::Canceled => return Ok(()),
                _ => {}
            }
            st.status = TaskState::Canceled;
            let mut executions: Vec<GroupExecution> = st.pending.drain(..).collect();
            executions.extend(st.current.take());
            (executions, st.members.clone())
        };

        info!(
            "Canceling {} with {} outstanding executions",
            self.id,
            executions.len()
        );
        for member in members {
            if matches!(
                member.state(),
                TaskState::Waiting | TaskState::Running | TaskState::Delayed
            ) {
                let _ = shared.cancel_task(&member);
            }
        }
        for execution in executions {
            execution.resolver.resolve(Err(TaskError::GroupCanceled));
        }
        if guard.borrow().released {
            self.unregister();
        }
        Ok(())
    }

    /// The owning handle was dropped
    pub(crate) fn release(&self) {
        let guard = self.state.lock();
        let idle = {
            let mut st = guard.borrow_mut();
            st.released = true;
            st.current.is_none()
        };
        if idle {
            self.unregister();
        }
    }

    fn unregister(&self) {
        let guard = self.state.lock();
        let members = {
            let mut st = guard.borrow_mut();
            if st.unregistered {
                return;
            }
            st.unregistered = true;
            std::mem::take(&mut st.members)
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.groups.lock().remove(&self.id);
        for member in members {
            member.release_ref();
            shared.maybe_reclaim(&member);
        }
        debug!("{} released", self.id);
    }
}

/// An ordered batch of tasks with aggregate completion.
///
/// Dropping the group releases it once no execution is in flight.
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

impl TaskGroup {
    pub(crate) fn new(inner: Arc<GroupInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> TaskState {
        self.inner.status()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a member. Only allowed before the first execution.
    pub fn add_task(&self, task: &Task) -> Result<()> {
        self.inner.add_task(task.inner())
    }

    /// Run every member. The handle resolves with the member outcomes in the
    /// order they were added.
    pub fn execute(&self, priority: Priority) -> Result<GroupHandle> {
        self.inner.execute(priority)
    }

    pub fn cancel(&self) -> Result<()> {
        self.inner.cancel()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.inner.release();
    }
}
