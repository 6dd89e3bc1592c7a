//! Worker threads and the background monitor that sizes the pool.

pub(crate) mod monitor;
pub(crate) mod worker;

use crate::task::{Priority, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a worker thread
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    /// Running one task for longer than the blocked timeout
    Blocked,
}

/// Manager-side bookkeeping for one worker
pub(crate) struct WorkerRecord {
    pub(crate) state: WorkerState,
    pub(crate) priority: Option<Priority>,
    pub(crate) idle_since: Instant,
    pub(crate) started_at: Option<Instant>,
    pub(crate) current_tasks: Vec<TaskId>,
    /// Long-running tasks this worker ran that were not terminated yet
    pub(crate) long_tasks: HashSet<TaskId>,
    pub(crate) executing_long_task: bool,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    pub(crate) fn new() -> Self {
        Self {
            state: WorkerState::Idle,
            priority: None,
            idle_since: Instant::now(),
            started_at: None,
            current_tasks: Vec::new(),
            long_tasks: HashSet::new(),
            executing_long_task: false,
            handle: None,
        }
    }

    pub(crate) fn assign(&mut self, task: TaskId, priority: Priority, long_running: bool) {
        self.state = WorkerState::Running;
        self.priority = Some(priority);
        self.started_at = Some(Instant::now());
        self.current_tasks.clear();
        self.current_tasks.push(task);
        self.executing_long_task = long_running;
        if long_running {
            self.long_tasks.insert(task);
        }
    }

    /// Back to idle. Returns whether the worker was busy before.
    pub(crate) fn set_idle(&mut self) -> bool {
        if self.state == WorkerState::Idle {
            return false;
        }
        self.state = WorkerState::Idle;
        self.priority = None;
        self.started_at = None;
        self.idle_since = Instant::now();
        self.current_tasks.clear();
        self.executing_long_task = false;
        true
    }

    /// A worker holding a long-running task is never retired by shrinking
    pub(crate) fn has_long_task(&self) -> bool {
        !self.long_tasks.is_empty()
    }

    /// Busy with work that keeps IDLE-priority tasks from dispatching
    pub(crate) fn is_busy_above_idle(&self) -> bool {
        self.state != WorkerState::Idle && self.priority != Some(Priority::Idle)
    }
}
