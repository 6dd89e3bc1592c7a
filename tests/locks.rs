use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use taskpool::locks::ThreadTag;
use taskpool::{
    AbortSignal, LockError, LockManager, LockMode, LockOptions, PoolConfig, Priority, Scheduler,
};

#[test]
fn test_two_thread_deadlock_is_reported_on_timeout() {
    let locks = LockManager::new();
    let a = locks.request("a");
    let b = locks.request("b");
    let barrier = Arc::new(Barrier::new(2));

    let first = {
        let (a, b, barrier) = (a.clone(), b.clone(), barrier.clone());
        std::thread::spawn(move || {
            let _held = a.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();
            barrier.wait();
            let result = b.acquire(
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_millis(500)),
            );
            (ThreadTag::current(), result.map(|_| ()))
        })
    };
    let second = {
        let (a, b, barrier) = (a.clone(), b.clone(), barrier.clone());
        std::thread::spawn(move || {
            let _held = b.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();
            barrier.wait();
            let result = a.acquire(
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_secs(5)),
            );
            (ThreadTag::current(), result.map(|_| ()))
        })
    };

    // While both requests are queued the detector sees one cycle
    let deadline = Instant::now() + Duration::from_millis(400);
    while locks.dependencies().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    let cycles = locks.check_deadlocks();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].threads.len(), 2);

    let (first_tag, first_result) = first.join().unwrap();
    let (second_tag, second_result) = second.join().unwrap();
    assert!(cycles[0].involves(first_tag));
    assert!(cycles[0].involves(second_tag));

    let err = first_result.unwrap_err();
    let warning = err.deadlock_warning().expect("Timeout should carry a deadlock warning");
    assert!(warning.starts_with("Deadlock detected"));
    assert!(warning.contains(&first_tag.to_string()));
    assert!(warning.contains(&second_tag.to_string()));

    // The first thread gave up and released `a`, so the second one got through
    assert!(second_result.is_ok());
    assert!(locks.check_deadlocks().is_empty());
}

#[test]
fn test_locks_serialize_pool_tasks() {
    let scheduler = Scheduler::new(PoolConfig::new(4, 4)).unwrap();
    let lock = scheduler.locks().request("counter");
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = lock.clone();
        let counter = counter.clone();
        handles.push(
            scheduler
                .submit(
                    move |_| {
                        let value = lock.with_lock(LockMode::Exclusive, LockOptions::new(), || {
                            let current = counter.load(Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(3));
                            counter.store(current + 1, Ordering::SeqCst);
                            current + 1
                        })?;
                        Ok(json!(value))
                    },
                    Priority::Medium,
                    &[],
                )
                .unwrap(),
        );
    }
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    assert!(!lock.is_locked());
    assert_eq!(scheduler.locks().query("counter").unwrap().holders.len(), 0);
}

#[test]
fn test_abort_from_another_thread() {
    let locks = LockManager::new();
    let lock = locks.request("resource");
    let _held = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();
    let signal = AbortSignal::new();

    let waiter = {
        let lock = lock.clone();
        let signal = signal.clone();
        std::thread::spawn(move || {
            lock.acquire(LockMode::Shared, LockOptions::new().with_signal(signal))
        })
    };
    while locks.query("resource").unwrap().pending.is_empty() {
        std::thread::yield_now();
    }
    signal.abort("shutting down");
    assert!(signal.is_aborted());

    match waiter.join().unwrap() {
        Err(LockError::Aborted { reason }) => assert_eq!(reason, "shutting down"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_is_available_fails_fast() {
    let locks = LockManager::new();
    let lock = locks.create();
    let guard = lock.acquire(LockMode::Exclusive, LockOptions::new()).unwrap();

    let started = Instant::now();
    let err = lock
        .acquire(LockMode::Shared, LockOptions::new().if_available())
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(err.as_label(), "lock_unavailable");
    assert_eq!(lock.info().pending.len(), 0);

    guard.release();
    assert!(lock.acquire(LockMode::Shared, LockOptions::new().if_available()).is_ok());
}

#[test]
fn test_snapshots_serialize() {
    let locks = LockManager::new();
    let lock = locks.request("snap");
    let _reader = lock.acquire(LockMode::Shared, LockOptions::new()).unwrap();

    let info = locks.query("snap").unwrap();
    let value = serde_json::to_value(&info).unwrap();
    assert_eq!(value["name"], json!("snap"));
    assert_eq!(value["mode"], json!("shared"));
    assert_eq!(value["holders"][0]["thread"], json!(ThreadTag::current().as_u64()));

    let all = serde_json::to_value(locks.query_all()).unwrap();
    assert_eq!(all.as_array().map(Vec::len), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_readers_share_and_writer_waits() {
    let locks = LockManager::new();
    let lock = locks.request("async-rw");

    let r1 = lock
        .acquire_async(LockMode::Shared, LockOptions::new())
        .await
        .unwrap();
    let r2 = lock
        .acquire_async(LockMode::Shared, LockOptions::new())
        .await
        .unwrap();

    let writer = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.acquire_async(
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_secs(2)),
            )
            .await
            .map(|guard| guard.mode())
        })
    };
    while lock.info().pending.is_empty() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    drop(r1);
    assert!(lock.info().pending.len() == 1);
    drop(r2);

    assert_eq!(writer.await.unwrap().unwrap(), LockMode::Exclusive);
    assert!(!lock.is_locked());
}
