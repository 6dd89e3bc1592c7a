use crate::pool::{WorkerId, WorkerState};
use crate::scheduler::manager::Shared;
use crate::task::*;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of the pool, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub captured_at: DateTime<Utc>,
    pub suspended: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub workers: Vec<WorkerInfo>,
    pub queued: Vec<QueueDepth>,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    pub priority: Option<Priority>,
    pub current_tasks: Vec<TaskId>,
    pub has_long_task: bool,
    pub retiring: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub priority: Priority,
    pub len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub task_type: TaskType,
    pub priority: Priority,
    pub group: Option<GroupId>,
    pub runner: Option<RunnerId>,
}

impl PoolInfo {
    pub fn pool_size(&self) -> usize {
        self.workers.iter().filter(|w| !w.retiring).count()
    }

    pub fn workers_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

impl Shared {
    pub(crate) fn info(&self) -> PoolInfo {
        let (mut workers, queued) = {
            let st = self.state.lock();
            let workers: Vec<WorkerInfo> = st
                .workers
                .iter()
                .map(|(id, record)| WorkerInfo {
                    id: *id,
                    state: record.state,
                    priority: record.priority,
                    current_tasks: record.current_tasks.clone(),
                    has_long_task: record.has_long_task(),
                    retiring: st.retiring.contains(id),
                })
                .collect();
            let queued = Priority::ALL
                .iter()
                .map(|priority| QueueDepth {
                    priority: *priority,
                    len: st.queues.lane_len(*priority),
                })
                .collect();
            (workers, queued)
        };
        workers.sort_by_key(|w| w.id);

        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .map(|entry| {
                let task = entry.value();
                TaskInfo {
                    id: task.id,
                    name: task.name.clone(),
                    state: task.state(),
                    task_type: task.task_type(),
                    priority: task.priority(),
                    group: task.group_id(),
                    runner: task.runner_id(),
                }
            })
            .collect();
        tasks.sort_by_key(|t| t.id);

        PoolInfo {
            captured_at: Utc::now(),
            suspended: self.is_suspended(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            workers,
            queued,
            tasks,
        }
    }
}
