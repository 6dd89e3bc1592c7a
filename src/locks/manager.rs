//! Registry of live locks, named and anonymous.

use crate::locks::ThreadTag;
use crate::locks::deadlock::{self, DeadlockInfo, LockDependency};
use crate::locks::lock::{AsyncLock, LockInner, LockMode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// Snapshot of one lock
#[derive(Serialize, Clone, Debug)]
pub struct LockInfo {
    pub name: String,
    /// Mode of the current holders, `None` when free
    pub mode: Option<LockMode>,
    pub holders: Vec<LockRequestInfo>,
    pub pending: Vec<LockRequestInfo>,
}

#[derive(Serialize, Clone, Debug)]
pub struct LockRequestInfo {
    pub request_id: u64,
    pub thread: ThreadTag,
    pub mode: LockMode,
    /// When the request was queued, or granted for holders
    pub since: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    all: BTreeMap<u64, Weak<LockInner>>,
    named: HashMap<String, AsyncLock>,
}

pub(crate) struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn live_locks(&self) -> Vec<Arc<LockInner>> {
        let mut st = self.state.lock();
        st.all.retain(|_, lock| lock.strong_count() > 0);
        st.all.values().filter_map(Weak::upgrade).collect()
    }

    /// Current wait-for edges across every live lock
    pub(crate) fn dependencies(&self) -> Vec<LockDependency> {
        let mut dependencies = Vec::new();
        for lock in self.live_locks() {
            lock.dependencies_into(&mut dependencies);
        }
        dependencies
    }
}

/// Creates locks and answers questions about all of them.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct LockManager {
    registry: Arc<Registry>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    fn register(&self, st: &mut RegistryState, name: Option<&str>) -> AsyncLock {
        st.next_id += 1;
        let id = st.next_id;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("lock-{}", id));
        let inner = Arc::new(LockInner::new(name, Arc::downgrade(&self.registry)));
        st.all.insert(id, Arc::downgrade(&inner));
        AsyncLock::from_inner(inner)
    }

    /// A new anonymous lock. It is dropped with its last handle.
    pub fn create(&self) -> AsyncLock {
        let mut st = self.registry.state.lock();
        self.register(&mut st, None)
    }

    /// The lock registered under `name`, created on first use. Named locks
    /// live as long as the manager.
    pub fn request(&self, name: &str) -> AsyncLock {
        let mut st = self.registry.state.lock();
        if let Some(lock) = st.named.get(name) {
            return lock.clone();
        }
        let lock = self.register(&mut st, Some(name));
        st.named.insert(name.to_string(), lock.clone());
        lock
    }

    pub fn dependencies(&self) -> Vec<LockDependency> {
        self.registry.dependencies()
    }

    /// Every wait-for cycle among the current requests
    pub fn check_deadlocks(&self) -> Vec<DeadlockInfo> {
        deadlock::check_deadlocks(&self.dependencies())
    }

    pub fn query(&self, name: &str) -> Option<LockInfo> {
        let lock = self.registry.state.lock().named.get(name).cloned();
        lock.map(|lock| lock.info())
    }

    pub fn query_all(&self) -> Vec<LockInfo> {
        self.registry
            .live_locks()
            .iter()
            .map(|lock| lock.snapshot())
            .collect()
    }

    /// [`query_all`](Self::query_all) rendered for logs
    pub fn describe(&self) -> String {
        deadlock::create_full_lock_infos_message(&self.query_all())
    }
}
