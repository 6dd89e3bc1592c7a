//! Error types used by the pool, the tasks it runs and the async locks.
//!
//! - [`TaskPoolError`] is returned synchronously by scheduler operations.
//! - [`TaskError`] is the terminal error of a task execution, delivered through
//!   handles, completion sinks and group result arrays.
//! - [`LockError`] is returned by [`AsyncLock`](crate::locks::AsyncLock) acquisitions.

use crate::task::TaskId;
use serde::Serialize;
use std::time::Duration;

/// Errors returned by scheduler operations.
///
/// None of these leave partial state behind: a rejected operation does not
/// touch the registry, the queues or the dependency tables.
#[derive(Debug, thiserror::Error)]
pub enum TaskPoolError {
    /// Malformed request: unknown priority, bad dependency, task already owned
    /// by a group or sequence runner, task in the wrong state.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The request was well-formed but cannot be applied to the current
    /// registry (missing dependency edge, unknown runner, ...).
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Invalid pool configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The scheduler has been shut down
    #[error("Scheduler is shut down")]
    Shutdown,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskPoolError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling(message.into())
    }

    /// Short stable label for logs
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskPoolError::Validation(_) => "validation_error",
            TaskPoolError::Scheduling(_) => "scheduling_error",
            TaskPoolError::Config(_) => "config_error",
            TaskPoolError::Shutdown => "shutdown",
            TaskPoolError::Lock(_) => "lock_error",
            TaskPoolError::Io(_) => "io_error",
        }
    }
}

/// Terminal error of a single task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// Cancelled while waiting, or its result was discarded after a cancel
    /// that arrived while it was running.
    #[error("Task has been canceled")]
    Canceled,

    /// A dependency was cancelled or failed, so this task can never run.
    #[error("Dependency {dependency} did not finish successfully")]
    DependencyFailed { dependency: TaskId },

    /// The payload returned an error.
    #[error("Execution failed: {message}")]
    Execution { message: String },

    /// The payload panicked on the worker thread.
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    /// The owning task group was cancelled.
    #[error("Task group has been canceled")]
    GroupCanceled,

    /// The pool shut down before the task could finish.
    #[error("Task pool has been shut down")]
    Shutdown,
}

impl TaskError {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Canceled => "task_canceled",
            TaskError::DependencyFailed { .. } => "dependency_failed",
            TaskError::Execution { .. } => "task_failed",
            TaskError::Panicked { .. } => "task_panicked",
            TaskError::GroupCanceled => "group_canceled",
            TaskError::Shutdown => "pool_shutdown",
        }
    }

    /// Whether this error comes from a cancellation rather than the task body
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Canceled
                | TaskError::GroupCanceled
                | TaskError::DependencyFailed { .. }
                | TaskError::Shutdown
        )
    }
}

/// Errors returned by lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The request waited longer than its timeout. When the wait-for graph
    /// contained a cycle at that moment, `deadlock` carries the diagnostic.
    #[error("Timeout after {timeout:?} waiting for lock '{lock}'{}", deadlock_suffix(.deadlock))]
    Timeout {
        lock: String,
        timeout: Duration,
        deadlock: Option<String>,
    },

    /// The request's abort signal fired before the lock was granted.
    #[error("Lock request aborted: {reason}")]
    Aborted { reason: String },

    /// `is_available` was set and the lock could not be granted immediately.
    #[error("Lock '{lock}' is not available")]
    Unavailable { lock: String },
}

impl LockError {
    pub fn as_label(&self) -> &'static str {
        match self {
            LockError::Timeout { .. } => "lock_timeout",
            LockError::Aborted { .. } => "lock_aborted",
            LockError::Unavailable { .. } => "lock_unavailable",
        }
    }

    /// Deadlock warning attached to a timeout, if any
    pub fn deadlock_warning(&self) -> Option<&str> {
        match self {
            LockError::Timeout { deadlock, .. } => deadlock.as_deref(),
            _ => None,
        }
    }
}

fn deadlock_suffix(deadlock: &Option<String>) -> String {
    deadlock
        .as_ref()
        .map(|warning| format!(". {warning}"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, TaskPoolError>;
