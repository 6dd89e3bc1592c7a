//! Completion handles.
//!
//! A [`Completion`] is the receiving half of a one-shot result slot. It can be
//! awaited as a `Future` or waited on from a plain thread. The sending half,
//! [`Resolver`], rejects with [`TaskError::Canceled`] if dropped unresolved.

use crate::error::TaskError;
use crate::task::types::{TaskId, TaskOutcome, TaskValue};
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

struct Slot<V> {
    value: Mutex<Option<Result<V, TaskError>>>,
    ready: Condvar,
    waker: AtomicWaker,
}

/// Receiving half of a result slot
pub struct Completion<V> {
    id: u64,
    slot: Arc<Slot<V>>,
}

/// Sending half of a result slot
pub(crate) struct Resolver<V> {
    slot: Option<Arc<Slot<V>>>,
}

/// Handle for a single task execution
pub type TaskHandle = Completion<TaskValue>;

/// Handle for one execution of a task group; resolves with the member
/// outcomes in the order the members were added.
pub type GroupHandle = Completion<Vec<TaskOutcome>>;

pub(crate) fn channel<V>(id: u64) -> (Resolver<V>, Completion<V>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Condvar::new(),
        waker: AtomicWaker::new(),
    });
    (
        Resolver {
            slot: Some(slot.clone()),
        },
        Completion { id, slot },
    )
}

impl<V> Resolver<V> {
    pub(crate) fn resolve(mut self, result: Result<V, TaskError>) {
        if let Some(slot) = self.slot.take() {
            Self::fill(&slot, result);
        }
    }

    fn fill(slot: &Slot<V>, result: Result<V, TaskError>) {
        {
            let mut value = slot.value.lock();
            if value.is_none() {
                *value = Some(result);
            }
        }
        slot.ready.notify_all();
        slot.waker.wake();
    }
}

impl<V> Drop for Resolver<V> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            Self::fill(&slot, Err(TaskError::Canceled));
        }
    }
}

impl<V> Completion<V> {
    /// Id of the task or group this handle belongs to
    pub fn raw_id(&self) -> u64 {
        self.id
    }

    /// Whether the result is available
    pub fn is_ready(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// Block the current thread until the result is available
    pub fn wait(self) -> Result<V, TaskError> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            self.slot.ready.wait(&mut value);
        }
    }

    /// Block for at most `timeout`; gives the handle back when it elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<V, TaskError>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut value = self.slot.value.lock();
            loop {
                if let Some(result) = value.take() {
                    return Ok(result);
                }
                if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                    if let Some(result) = value.take() {
                        return Ok(result);
                    }
                    break;
                }
            }
        }
        Err(self)
    }
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        TaskId::from_raw(self.id)
    }
}

impl<V> Future for Completion<V> {
    type Output = Result<V, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.waker.register(cx.waker());
        match self.slot.value.lock().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<V> std::fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}
