//! Cooperative shared/exclusive locks usable from any thread.
//!
//! Locks are created through a [`LockManager`], which keeps a registry of every
//! live lock so that the deadlock detector can build a wait-for graph between
//! threads: `A -> B` when a request of thread `A` is queued on a lock held by
//! thread `B`. The detector is advisory; its findings are attached to
//! [`LockError::Timeout`](crate::error::LockError::Timeout).

pub mod deadlock;
mod graph;
pub mod lock;
pub mod manager;

pub use deadlock::{DeadlockInfo, LockDependency};
pub use lock::{AbortSignal, AsyncLock, LockGuard, LockMode, LockOptions};
pub use manager::{LockInfo, LockManager, LockRequestInfo};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Stable numeric identity of an OS thread, used as a node of the wait-for graph
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadTag(u64);

impl ThreadTag {
    pub fn current() -> Self {
        THREAD_TAG.with(|tag| Self(*tag))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tag_is_stable_per_thread() {
        let here = ThreadTag::current();
        assert_eq!(here, ThreadTag::current());

        let there = std::thread::spawn(ThreadTag::current).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(there.to_string(), format!("thread-{}", there.as_u64()));
    }
}
