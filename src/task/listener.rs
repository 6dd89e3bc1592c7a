//! Lifecycle notifications.
//!
//! Two kinds of listeners exist. A [`CompletionSink`] is attached to a single
//! task and receives at most one call per callback per execution. A
//! [`TaskEventHandler`] is registered on the scheduler and sees every
//! [`TaskEvent`]. Both are invoked on the host loop thread, in the order the
//! events were produced.

use crate::error::TaskError;
use crate::pool::{WorkerId, WorkerState};
use crate::task::types::{Priority, TaskId, TaskValue};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Per-task lifecycle callbacks. Every method defaults to a no-op.
///
/// Cancelled executions (including results discarded after a cancel and
/// dependents rejected because a dependency failed) produce no sink callbacks.
pub trait CompletionSink: Send + Sync {
    fn on_enqueued(&self, _task: TaskId) {}

    fn on_start_execution(&self, _task: TaskId) {}

    fn on_execution_succeeded(&self, _task: TaskId, _result: &TaskValue) {}

    fn on_execution_failed(&self, _task: TaskId, _error: &TaskError) {}

    /// A value the running body passed to
    /// [`TaskContext::send_data`](crate::TaskContext::send_data)
    fn on_receive_data(&self, _task: TaskId, _data: &TaskValue) {}
}

/// Events that can occur while the scheduler runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskEnqueued {
        task_id: TaskId,
        priority: Priority,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
        started_at: DateTime<Utc>,
    },
    TaskSucceeded {
        task_id: TaskId,
        finished_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    TaskCanceled {
        task_id: TaskId,
        reason: TaskError,
    },
    WorkerSpawned {
        worker_id: WorkerId,
        pool_size: usize,
    },
    WorkerRetired {
        worker_id: WorkerId,
        pool_size: usize,
    },
    WorkerStateChanged {
        worker_id: WorkerId,
        old_state: WorkerState,
        new_state: WorkerState,
    },
}

/// Handler for scheduler events
pub trait TaskEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()>;
}

/// Event handler that turns every event into a log line
pub struct LoggingEventHandler;

impl TaskEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()> {
        match event {
            TaskEvent::TaskEnqueued { task_id, priority } => {
                debug!("Task enqueued: {} ({})", task_id, priority);
            }
            TaskEvent::TaskStarted {
                task_id, worker_id, ..
            } => {
                debug!("Task {} started on worker {}", task_id, worker_id);
            }
            TaskEvent::TaskSucceeded { task_id, .. } => {
                info!("Task completed: {}", task_id);
            }
            TaskEvent::TaskFailed { task_id, error } => {
                warn!("Task failed: {} - {}", task_id, error);
            }
            TaskEvent::TaskCanceled { task_id, reason } => {
                info!("Task canceled: {} ({})", task_id, reason.as_label());
            }
            TaskEvent::WorkerSpawned {
                worker_id,
                pool_size,
            } => {
                info!("Worker {} spawned, pool size {}", worker_id, pool_size);
            }
            TaskEvent::WorkerRetired {
                worker_id,
                pool_size,
            } => {
                info!("Worker {} retired, pool size {}", worker_id, pool_size);
            }
            TaskEvent::WorkerStateChanged {
                worker_id,
                old_state,
                new_state,
            } => {
                if *new_state == WorkerState::Blocked {
                    warn!("Worker {} is blocked (was {:?})", worker_id, old_state);
                } else {
                    debug!(
                        "Worker {} state: {:?} -> {:?}",
                        worker_id, old_state, new_state
                    );
                }
            }
        }
        Ok(())
    }
}
