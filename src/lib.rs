//! # taskpool
//!
//! A cooperative worker-thread pool with a priority scheduler, task
//! dependencies, task groups, sequence runners, delayed and periodic tasks,
//! and shared/exclusive locks with deadlock diagnostics.
//!
//! ## Architecture Overview
//!
//! - **[`scheduler`]**: the [`Scheduler`] facade, the task registry, the ready
//!   queues (HIGH > MEDIUM > LOW > IDLE), the dependency graph, the timer
//!   thread and the host loop that delivers callbacks
//! - **[`pool`]**: worker threads and the monitor that expands the pool, retires
//!   idle workers and flags blocked ones
//! - **[`task`]**: tasks, payloads, completion handles and lifecycle callbacks
//! - **[`group`]**: [`TaskGroup`] (all-or-nothing batches) and
//!   [`SequenceRunner`] (strict submission order)
//! - **[`locks`]**: [`AsyncLock`] and the [`LockManager`] deadlock detector
//! - **[`config`]**: pool sizing and timing, loadable from TOML
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskpool::{PoolConfig, Priority, Scheduler};
//!
//! fn main() -> anyhow::Result<()> {
//!     let scheduler = Scheduler::new(PoolConfig::new(1, 4))?;
//!
//!     let fetch = scheduler.create_task("fetch", |_| Ok(serde_json::json!(21)));
//!     let handle = scheduler.execute(&fetch, Priority::High)?;
//!     let double = scheduler.submit(|_| Ok(serde_json::json!(42)), Priority::Low, &[fetch.id()])?;
//!
//!     assert_eq!(handle.wait()?, serde_json::json!(21));
//!     assert_eq!(double.wait()?, serde_json::json!(42));
//!     scheduler.shutdown();
//!     Ok(())
//! }
//! ```

/// Pool sizing and timing configuration.
pub mod config;

/// Error types for scheduler operations, task executions and locks.
pub mod error;

/// Task groups and sequence runners.
pub mod group;

/// Cooperative shared/exclusive locks and deadlock detection.
pub mod locks;

/// Worker threads and pool monitoring.
pub mod pool;

/// The scheduler and its supporting machinery.
pub mod scheduler;

/// Task model: records, payloads, handles and listeners.
pub mod task;

pub use config::PoolConfig;
pub use error::{LockError, Result, TaskError, TaskPoolError};
pub use group::{SequenceRunner, TaskGroup};
pub use locks::{AbortSignal, AsyncLock, LockGuard, LockManager, LockMode, LockOptions};
pub use pool::{WorkerId, WorkerState};
pub use scheduler::{PoolInfo, Scheduler};
pub use task::{
    CompletionSink, DurationKind, GroupHandle, LoggingEventHandler, Priority, Task, TaskContext,
    TaskEvent, TaskEventHandler, TaskHandle, TaskId, TaskState, TaskType, TaskValue,
};
