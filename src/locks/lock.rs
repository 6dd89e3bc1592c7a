//! The lock itself: a FIFO queue of shared/exclusive requests.
//!
//! Synchronous callers block on a condition variable; asynchronous callers
//! wait on a per-request [`Notify`]. Both kinds of request share one queue,
//! so the wait-for bookkeeping seen by the deadlock detector is the same.

use crate::error::LockError;
use crate::locks::ThreadTag;
use crate::locks::deadlock::{LockDependency, create_deadlock_warning_message, find_deadlock};
use crate::locks::manager::{LockInfo, LockRequestInfo, Registry};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether a request in this mode can join the current holders
    fn compatible_with(self, held: Option<LockMode>) -> bool {
        match held {
            None => true,
            Some(LockMode::Shared) => self == LockMode::Shared,
            Some(LockMode::Exclusive) => false,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Cancels queued lock requests that were made with it.
///
/// Aborting is sticky: requests made after the signal fired fail immediately.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Mutex<AbortState>>,
}

#[derive(Default)]
struct AbortState {
    reason: Option<String>,
    subscribers: Vec<(Weak<LockInner>, u64)>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every queued request made with this signal. Only the first
    /// reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let subscribers = {
            let mut state = self.inner.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.subscribers)
        };
        for (lock, request) in subscribers {
            if let Some(lock) = lock.upgrade() {
                lock.abort_request(request, &reason);
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.lock().reason.clone()
    }

    /// Returns the abort reason instead of subscribing when already aborted
    fn subscribe(&self, lock: &Arc<LockInner>, request: u64) -> Option<String> {
        let mut state = self.inner.lock();
        if let Some(reason) = &state.reason {
            return Some(reason.clone());
        }
        state.subscribers.push((Arc::downgrade(lock), request));
        None
    }

    fn unsubscribe(&self, request: u64) {
        self.inner.lock().subscribers.retain(|(_, id)| *id != request);
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Per-acquisition options
#[derive(Clone, Debug, Default)]
pub struct LockOptions {
    /// Fail with [`LockError::Unavailable`] instead of queuing
    pub is_available: bool,
    /// Give up after this long, with a deadlock diagnostic when one exists
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn if_available(mut self) -> Self {
        self.is_available = true;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum RequestStatus {
    Pending,
    Granted,
    Aborted(String),
}

struct LockRequest {
    id: u64,
    thread: ThreadTag,
    mode: LockMode,
    since: DateTime<Utc>,
    /// Written only with the owning lock's state mutex held
    status: Mutex<RequestStatus>,
    notify: Notify,
}

impl LockRequest {
    fn status(&self) -> RequestStatus {
        self.status.lock().clone()
    }

    fn info(&self) -> LockRequestInfo {
        LockRequestInfo {
            request_id: self.id,
            thread: self.thread,
            mode: self.mode,
            since: self.since,
        }
    }
}

struct Holder {
    request: u64,
    thread: ThreadTag,
    mode: LockMode,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct LockState {
    mode: Option<LockMode>,
    holders: Vec<Holder>,
    waiters: VecDeque<Arc<LockRequest>>,
}

pub(crate) struct LockInner {
    name: String,
    state: Mutex<LockState>,
    granted: Condvar,
    registry: Weak<Registry>,
}

impl LockInner {
    pub(crate) fn new(name: String, registry: Weak<Registry>) -> Self {
        Self {
            name,
            state: Mutex::new(LockState::default()),
            granted: Condvar::new(),
            registry,
        }
    }

    /// Grant immediately or queue the request
    fn begin(self: &Arc<Self>, mode: LockMode, options: &LockOptions) -> Result<Begin, LockError> {
        if let Some(reason) = options.signal.as_ref().and_then(AbortSignal::reason) {
            return Err(LockError::Aborted { reason });
        }

        let thread = ThreadTag::current();
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state.lock();

        if st.waiters.is_empty() && mode.compatible_with(st.mode) {
            st.holders.push(Holder {
                request: id,
                thread,
                mode,
                since: Utc::now(),
            });
            st.mode = Some(mode);
            return Ok(Begin::Granted(LockGuard {
                lock: self.clone(),
                request: id,
                mode,
            }));
        }
        if options.is_available {
            return Err(LockError::Unavailable {
                lock: self.name.clone(),
            });
        }

        let request = Arc::new(LockRequest {
            id,
            thread,
            mode,
            since: Utc::now(),
            status: Mutex::new(RequestStatus::Pending),
            notify: Notify::new(),
        });
        st.waiters.push_back(request.clone());
        if let Some(signal) = &options.signal {
            if let Some(reason) = signal.subscribe(self, id) {
                st.waiters.retain(|r| r.id != id);
                return Err(LockError::Aborted { reason });
            }
        }
        debug!("{} queued {} request on lock '{}'", thread, mode, self.name);

        Ok(Begin::Queued(PendingRequest {
            lock: self.clone(),
            request,
            signal: options.signal.clone(),
            settled: false,
        }))
    }

    /// Admit the next compatible run of waiters: consecutive shared requests
    /// together, or a single exclusive request once the lock is free.
    fn grant_waiters_locked(&self, st: &mut LockState) {
        let mut granted = false;
        while st
            .waiters
            .front()
            .is_some_and(|front| front.mode.compatible_with(st.mode))
        {
            let Some(request) = st.waiters.pop_front() else {
                break;
            };
            st.holders.push(Holder {
                request: request.id,
                thread: request.thread,
                mode: request.mode,
                since: Utc::now(),
            });
            st.mode = Some(request.mode);
            *request.status.lock() = RequestStatus::Granted;
            request.notify.notify_one();
            granted = true;
            if request.mode == LockMode::Exclusive {
                break;
            }
        }
        if granted {
            self.granted.notify_all();
        }
    }

    fn release_locked(&self, st: &mut LockState, request: u64) {
        st.holders.retain(|h| h.request != request);
        if st.holders.is_empty() {
            st.mode = None;
        }
        self.grant_waiters_locked(st);
    }

    fn release(&self, request: u64) {
        let mut st = self.state.lock();
        self.release_locked(&mut st, request);
    }

    fn abort_request(&self, request: u64, reason: &str) {
        let mut st = self.state.lock();
        let Some(index) = st.waiters.iter().position(|r| r.id == request) else {
            return;
        };
        if let Some(aborted) = st.waiters.remove(index) {
            *aborted.status.lock() = RequestStatus::Aborted(reason.to_string());
            aborted.notify.notify_one();
            debug!("Aborted request {} on lock '{}': {}", request, self.name, reason);
        }
        self.granted.notify_all();
        self.grant_waiters_locked(&mut st);
    }

    /// Take a request back out of the lock, releasing it when it was granted
    fn withdraw(&self, request: &LockRequest) {
        let mut st = self.state.lock();
        if request.status() == RequestStatus::Granted {
            self.release_locked(&mut st, request.id);
        } else {
            st.waiters.retain(|r| r.id != request.id);
            self.grant_waiters_locked(&mut st);
        }
    }

    fn deadlock_warning(&self, thread: ThreadTag) -> Option<String> {
        let registry = self.registry.upgrade()?;
        let dependencies = registry.dependencies();
        find_deadlock(&dependencies, thread).map(|info| create_deadlock_warning_message(&info))
    }

    pub(crate) fn dependencies_into(&self, out: &mut Vec<LockDependency>) {
        let st = self.state.lock();
        for waiter in &st.waiters {
            for holder in &st.holders {
                out.push(LockDependency {
                    waiter: waiter.thread,
                    holder: holder.thread,
                    lock: self.name.clone(),
                });
            }
        }
    }

    pub(crate) fn snapshot(&self) -> LockInfo {
        let st = self.state.lock();
        LockInfo {
            name: self.name.clone(),
            mode: st.mode,
            holders: st
                .holders
                .iter()
                .map(|h| LockRequestInfo {
                    request_id: h.request,
                    thread: h.thread,
                    mode: h.mode,
                    since: h.since,
                })
                .collect(),
            pending: st.waiters.iter().map(|r| r.info()).collect(),
        }
    }
}

enum Begin {
    Granted(LockGuard),
    Queued(PendingRequest),
}

/// A queued request. Dropping it without converting it into a guard takes
/// the request back out of the lock.
struct PendingRequest {
    lock: Arc<LockInner>,
    request: Arc<LockRequest>,
    signal: Option<AbortSignal>,
    settled: bool,
}

impl PendingRequest {
    fn into_guard(mut self) -> LockGuard {
        self.settled = true;
        LockGuard {
            lock: self.lock.clone(),
            request: self.request.id,
            mode: self.request.mode,
        }
    }

    fn wait_blocking(self, timeout: Option<Duration>) -> Result<LockGuard, LockError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.lock.state.lock();
        loop {
            match self.request.status() {
                RequestStatus::Granted => {
                    drop(st);
                    return Ok(self.into_guard());
                }
                RequestStatus::Aborted(reason) => return Err(LockError::Aborted { reason }),
                RequestStatus::Pending => {}
            }
            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if self.lock.granted.wait_until(&mut st, deadline).timed_out() {
                        drop(st);
                        return self.time_out(timeout);
                    }
                }
                _ => self.lock.granted.wait(&mut st),
            }
        }
    }

    async fn wait_async(&self) -> Result<(), LockError> {
        loop {
            match self.request.status() {
                RequestStatus::Granted => return Ok(()),
                RequestStatus::Aborted(reason) => return Err(LockError::Aborted { reason }),
                RequestStatus::Pending => {}
            }
            self.request.notify.notified().await;
        }
    }

    /// The diagnostic is computed while the request is still queued, so the
    /// wait-for graph still contains this thread's edges.
    fn time_out(self, timeout: Duration) -> Result<LockGuard, LockError> {
        let warning = self.lock.deadlock_warning(self.request.thread);

        let mut st = self.lock.state.lock();
        match self.request.status() {
            RequestStatus::Granted => {
                drop(st);
                return Ok(self.into_guard());
            }
            RequestStatus::Aborted(reason) => return Err(LockError::Aborted { reason }),
            RequestStatus::Pending => {
                let id = self.request.id;
                st.waiters.retain(|r| r.id != id);
                self.lock.grant_waiters_locked(&mut st);
            }
        }
        drop(st);

        match &warning {
            Some(message) => warn!("Timeout on lock '{}'. {}", self.lock.name, message),
            None => debug!("Timeout on lock '{}' after {:?}", self.lock.name, timeout),
        }
        Err(LockError::Timeout {
            lock: self.lock.name.clone(),
            timeout,
            deadlock: warning,
        })
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(signal) = &self.signal {
            signal.unsubscribe(self.request.id);
        }
        if !self.settled {
            self.lock.withdraw(&self.request);
        }
    }
}

/// Proof of holding a lock. Releases on drop.
pub struct LockGuard {
    lock: Arc<LockInner>,
    request: u64,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_name(&self) -> &str {
        &self.lock.name
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(self.request);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock.name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Cooperative shared/exclusive lock, created by a
/// [`LockManager`](crate::locks::LockManager). Cloning yields another handle
/// to the same lock.
#[derive(Clone)]
pub struct AsyncLock {
    inner: Arc<LockInner>,
}

impl AsyncLock {
    pub(crate) fn from_inner(inner: Arc<LockInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Acquire the lock, blocking the calling thread while queued
    pub fn acquire(&self, mode: LockMode, options: LockOptions) -> Result<LockGuard, LockError> {
        match self.inner.begin(mode, &options)? {
            Begin::Granted(guard) => Ok(guard),
            Begin::Queued(pending) => pending.wait_blocking(options.timeout),
        }
    }

    /// Acquire the lock without blocking the executor. Dropping the future
    /// while queued withdraws the request.
    pub async fn acquire_async(
        &self,
        mode: LockMode,
        options: LockOptions,
    ) -> Result<LockGuard, LockError> {
        let pending = match self.inner.begin(mode, &options)? {
            Begin::Granted(guard) => return Ok(guard),
            Begin::Queued(pending) => pending,
        };
        match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, pending.wait_async()).await {
                Ok(Ok(())) => Ok(pending.into_guard()),
                Ok(Err(e)) => Err(e),
                Err(_) => pending.time_out(timeout),
            },
            None => {
                pending.wait_async().await?;
                Ok(pending.into_guard())
            }
        }
    }

    /// Run `f` while holding the lock
    pub fn with_lock<R>(
        &self,
        mode: LockMode,
        options: LockOptions,
        f: impl FnOnce() -> R,
    ) -> Result<R, LockError> {
        let guard = self.acquire(mode, options)?;
        let result = f();
        guard.release();
        Ok(result)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().mode.is_some()
    }

    pub fn info(&self) -> LockInfo {
        self.inner.snapshot()
    }
}

impl fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLock")
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use std::sync::{Arc, Barrier, mpsc};
    use std::thread;

    #[test]
    fn test_shared_holders_coexist() {
        let locks = LockManager::new();
        let lock = locks.request("cache");

        let a = lock.acquire(LockMode::Shared, LockOptions::new()).unwrap();
        let b = lock.acquire(LockMode::Shared, LockOptions::new()).unwrap();
        assert_eq!(lock.info().holders.len(), 2);

        let err = lock
            .acquire(LockMode::Exclusive, LockOptions::new().if_available())
            .unwrap_err();
        assert_eq!(err, LockError::Unavailable { lock: "cache".to_string() });

        a.release();
        b.release();
        assert!(!lock.is_locked());
        let c = lock
            .acquire(LockMode::Exclusive, LockOptions::new().if_available())
            .unwrap();
        assert_eq!(c.mode(), LockMode::Exclusive);
    }

    #[test]
    fn test_release_admits_consecutive_shared_waiters() {
        let locks = LockManager::new();
        let lock = locks.request("fifo");
        let guard = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();

        let (tx, rx) = mpsc::channel();
        // Both readers and the main thread meet here while the readers hold
        let both_in = Arc::new(Barrier::new(3));
        let mut handles = Vec::new();
        for i in 0..2 {
            let lock = lock.clone();
            let tx = tx.clone();
            let both_in = both_in.clone();
            handles.push(thread::spawn(move || {
                let g = lock.acquire(LockMode::Shared, LockOptions::new()).unwrap();
                tx.send(i).unwrap();
                both_in.wait();
                drop(g);
            }));
        }
        while lock.info().pending.len() < 2 {
            thread::yield_now();
        }
        assert!(rx.try_recv().is_err());

        guard.release();
        let mut got: Vec<i32> = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        got.sort();
        assert_eq!(got, vec![0, 1]);
        assert_eq!(lock.info().holders.len(), 2);
        both_in.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_exclusive_waiter_blocks_later_shared() {
        let locks = LockManager::new();
        let lock = locks.request("writer-first");
        let reader = lock.acquire(LockMode::Shared, LockOptions::new()).unwrap();

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.acquire(LockMode::Exclusive, LockOptions::new())
                    .map(|g| g.mode())
            })
        };
        while lock.info().pending.is_empty() {
            thread::yield_now();
        }

        // A queued writer keeps new readers out
        let err = lock
            .acquire(LockMode::Shared, LockOptions::new().if_available())
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }));

        reader.release();
        assert_eq!(writer.join().unwrap().unwrap(), LockMode::Exclusive);
    }

    #[test]
    fn test_timeout_without_cycle_has_no_warning() {
        let locks = LockManager::new();
        let lock = locks.request("slow");
        let _held = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();

        let lock2 = lock.clone();
        let err = thread::spawn(move || {
            lock2
                .acquire(
                    LockMode::Exclusive,
                    LockOptions::new().with_timeout(Duration::from_millis(50)),
                )
                .unwrap_err()
        })
        .join()
        .unwrap();

        match err {
            LockError::Timeout { lock, deadlock, .. } => {
                assert_eq!(lock, "slow");
                assert!(deadlock.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(lock.info().pending.is_empty());
    }

    #[test]
    fn test_abort_rejects_queued_request() {
        let locks = LockManager::new();
        let lock = locks.request("abortable");
        let _held = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();
        let signal = AbortSignal::new();

        let waiter = {
            let lock = lock.clone();
            let signal = signal.clone();
            thread::spawn(move || {
                lock.acquire(LockMode::Exclusive, LockOptions::new().with_signal(signal))
                    .unwrap_err()
            })
        };
        while lock.info().pending.is_empty() {
            thread::yield_now();
        }
        signal.abort("user left");

        assert_eq!(
            waiter.join().unwrap(),
            LockError::Aborted { reason: "user left".to_string() }
        );
        assert!(lock.info().pending.is_empty());

        // Sticky: later requests fail straight away
        let err = lock
            .acquire(LockMode::Shared, LockOptions::new().with_signal(signal))
            .unwrap_err();
        assert!(matches!(err, LockError::Aborted { .. }));
    }

    #[test]
    fn test_with_lock_releases() {
        let locks = LockManager::new();
        let lock = locks.create();
        let value = lock
            .with_lock(LockMode::Exclusive, LockOptions::new(), || {
                assert!(lock.is_locked());
                7
            })
            .unwrap();
        assert_eq!(value, 7);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_async_acquire_waits_for_release() {
        let locks = LockManager::new();
        let lock = locks.request("async");
        let held = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire_async(LockMode::Shared, LockOptions::new())
                    .await
                    .map(|g| g.mode())
            })
        };
        while lock.info().pending.is_empty() {
            tokio::task::yield_now().await;
        }
        held.release();
        assert_eq!(waiter.await.unwrap().unwrap(), LockMode::Shared);
    }

    #[tokio::test]
    async fn test_async_timeout_and_dropped_future_withdraw() {
        let locks = LockManager::new();
        let lock = locks.request("async-timeout");
        let held = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();

        let err = lock
            .acquire_async(
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(lock.info().pending.is_empty());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            lock.acquire_async(LockMode::Exclusive, LockOptions::new()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(lock.info().pending.is_empty());

        held.release();
        assert!(!lock.is_locked());
    }
}
