//! The opaque unit of work a task runs.
//!
//! The pool never looks inside a payload: it calls [`Payload::invoke`] on a
//! worker thread and treats the returned value or error as the task result.

use crate::error::{Result, TaskPoolError};
use crate::scheduler::Shared;
use crate::task::record::TaskInner;
use crate::task::types::{TaskId, TaskState, TaskValue};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Something a worker can run.
pub trait Payload: Send + Sync {
    fn invoke(&self, ctx: &TaskContext) -> anyhow::Result<TaskValue>;
}

/// Payload backed by a closure
pub struct FnPayload<F>(F);

impl<F> FnPayload<F>
where
    F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }

    pub fn arc(f: F) -> Arc<dyn Payload> {
        Arc::new(Self(f))
    }
}

impl<F> Payload for FnPayload<F>
where
    F: Fn(&TaskContext) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &TaskContext) -> anyhow::Result<TaskValue> {
        (self.0)(ctx)
    }
}

/// View of the running task handed to its payload
pub struct TaskContext {
    task: Arc<TaskInner>,
    shared: Weak<Shared>,
}

impl TaskContext {
    pub(crate) fn new(task: Arc<TaskInner>, shared: Weak<Shared>) -> Self {
        Self { task, shared }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// True once the task was cancelled while this body is running. The
    /// result will be discarded either way; bodies may poll this to stop early.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self.task.state(),
            TaskState::Canceled | TaskState::Ending
        )
    }

    /// Hand an intermediate value to the task's
    /// [`CompletionSink::on_receive_data`](crate::CompletionSink::on_receive_data).
    /// Delivery happens on the host loop, in send order, while the body keeps
    /// running. Fails when the task has no sink attached.
    pub fn send_data(&self, data: TaskValue) -> Result<()> {
        let Some(sink) = self.task.slot.lock().sink.clone() else {
            return Err(TaskPoolError::validation(format!(
                "task {} has no completion sink to receive data",
                self.task.id
            )));
        };
        let shared = self.shared.upgrade().ok_or(TaskPoolError::Shutdown)?;
        let id = self.task.id;
        debug!("Task {} sent data to the host loop", id);
        shared.host.post(move || sink.on_receive_data(id, &data));
        Ok(())
    }
}
