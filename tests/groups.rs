use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use taskpool::{PoolConfig, Priority, Scheduler, TaskError, TaskPoolError, TaskState};

fn pool(min: usize, max: usize) -> Scheduler {
    let config = PoolConfig::new(min, max).with_monitor_interval(Duration::from_millis(20));
    Scheduler::new(config).expect("Should be able to start the pool")
}

#[test]
fn test_group_results_follow_member_order() {
    let scheduler = pool(3, 3);
    let group = scheduler.task_group("ordered");
    for (index, sleep_ms) in [(0u64, 40u64), (1, 5), (2, 20)] {
        let task = scheduler.create_task(format!("member-{}", index), move |_| {
            std::thread::sleep(Duration::from_millis(sleep_ms));
            Ok(json!(index))
        });
        group.add_task(&task).expect("Should add the member");
        assert_eq!(task.group_id(), Some(group.id()));
    }
    assert_eq!(group.len(), 3);
    assert_eq!(group.state(), TaskState::NotFound);

    let results = group.execute(Priority::High).unwrap().wait().unwrap();
    let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(group.state(), TaskState::Finished);

    // A finished group can run again
    let again = group.execute(Priority::Low).unwrap().wait().unwrap();
    assert_eq!(again.len(), 3);
}

#[test]
fn test_member_failure_is_reported_in_place() {
    let scheduler = pool(1, 2);
    let group = scheduler.task_group("mixed");
    let ok = scheduler.create_task("ok", |_| Ok(json!("fine")));
    let bad = scheduler.create_task("bad", |_| anyhow::bail!("broken member"));
    group.add_task(&ok).unwrap();
    group.add_task(&bad).unwrap();

    let results = group.execute(Priority::Medium).unwrap().wait().unwrap();
    assert_eq!(results[0], Ok(json!("fine")));
    assert!(matches!(results[1], Err(TaskError::Execution { .. })));
}

#[test]
fn test_empty_group_resolves_immediately() {
    let scheduler = pool(1, 1);
    let group = scheduler.task_group("empty");
    assert!(group.is_empty());
    let results = group.execute(Priority::Medium).unwrap().wait().unwrap();
    assert!(results.is_empty());
    assert_eq!(group.state(), TaskState::Finished);
}

#[test]
fn test_cancel_group() {
    let scheduler = pool(1, 1);
    let group = scheduler.task_group("doomed");
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);

    let first = scheduler.create_task("first", move |ctx| {
        let _ = started_tx.lock().send(());
        while !ctx.is_canceled() {
            if release_rx.lock().recv_timeout(Duration::from_millis(5)).is_ok() {
                break;
            }
        }
        Ok(json!("first"))
    });
    let second = scheduler.create_task("second", |_| Ok(json!("second")));
    group.add_task(&first).unwrap();
    group.add_task(&second).unwrap();

    let handle = group.execute(Priority::Medium).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    group.cancel().unwrap();

    assert_eq!(handle.wait().unwrap_err(), TaskError::GroupCanceled);
    assert_eq!(group.state(), TaskState::Canceled);
    assert_eq!(second.state(), TaskState::Canceled);
    drop(release_tx);

    assert!(matches!(
        group.execute(Priority::Medium),
        Err(TaskPoolError::Validation(_))
    ));
    // Cancelling twice is a no-op
    group.cancel().unwrap();
}

#[test]
fn test_back_to_back_executions_run_one_after_another() {
    let scheduler = pool(3, 3);
    let group = scheduler.task_group("twice");
    let spans = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
    for index in 0..3u64 {
        let spans = spans.clone();
        let task = scheduler.create_task(format!("member-{}", index), move |_| {
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(20 + 10 * index));
            spans.lock().push((start, Instant::now()));
            Ok(json!(index))
        });
        group.add_task(&task).unwrap();
    }

    let first = group.execute(Priority::Medium).unwrap();
    let second = group.execute(Priority::High).unwrap();
    let expected: Vec<Result<serde_json::Value, TaskError>> =
        vec![Ok(json!(0)), Ok(json!(1)), Ok(json!(2))];
    assert_eq!(first.wait().unwrap(), expected);
    assert_eq!(second.wait().unwrap(), expected);

    let mut spans = spans.lock().clone();
    assert_eq!(spans.len(), 6);
    spans.sort_by_key(|(start, _)| *start);
    let first_done = spans[..3].iter().map(|(_, end)| *end).max().unwrap();
    let second_started = spans[3..].iter().map(|(start, _)| *start).min().unwrap();
    assert!(first_done <= second_started, "queued execution started early");
    assert_eq!(group.state(), TaskState::Finished);
}

#[test]
fn test_cancel_rejects_queued_executions() {
    let scheduler = pool(2, 2);
    let group = scheduler.task_group("backlog");
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let fast_runs = Arc::new(AtomicUsize::new(0));

    let slow = scheduler.create_task("slow", move |ctx| {
        let _ = started_tx.lock().send(());
        while !ctx.is_canceled() {
            if release_rx.lock().recv_timeout(Duration::from_millis(5)).is_ok() {
                break;
            }
        }
        Ok(json!("slow"))
    });
    let fast = {
        let fast_runs = fast_runs.clone();
        scheduler.create_task("fast", move |_| {
            fast_runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!("fast"))
        })
    };
    group.add_task(&slow).unwrap();
    group.add_task(&fast).unwrap();

    let current = group.execute(Priority::Medium).unwrap();
    let queued: Vec<_> = (0..2)
        .map(|_| group.execute(Priority::Medium).unwrap())
        .collect();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    group.cancel().unwrap();

    assert_eq!(current.wait().unwrap_err(), TaskError::GroupCanceled);
    for handle in queued {
        assert_eq!(handle.wait().unwrap_err(), TaskError::GroupCanceled);
    }
    drop(release_tx);
    std::thread::sleep(Duration::from_millis(50));
    assert!(fast_runs.load(Ordering::SeqCst) <= 1, "queued executions must not run");
}

#[test]
fn test_cancelling_last_unfinished_member_rejects_execution() {
    let scheduler = pool(2, 2);
    let group = scheduler.task_group("last-one");
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);

    let done = scheduler.create_task("done", |_| Ok(json!("done")));
    let lingering = scheduler.create_task("lingering", move |ctx| {
        let _ = started_tx.lock().send(());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ctx.is_canceled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(json!("lingering"))
    });
    group.add_task(&done).unwrap();
    group.add_task(&lingering).unwrap();

    let handle = group.execute(Priority::Medium).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while done.state() != TaskState::Finished && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(done.state(), TaskState::Finished);

    scheduler.cancel(lingering.id()).unwrap();
    assert_eq!(handle.wait().unwrap_err(), TaskError::GroupCanceled);
    assert_eq!(lingering.state(), TaskState::Canceled);
}

#[test]
fn test_group_validation() {
    let scheduler = pool(1, 1);
    let group = scheduler.task_group("strict");
    assert!(matches!(group.cancel(), Err(TaskPoolError::Scheduling(_))));

    let member = scheduler.create_task("member", |_| Ok(json!(null)));
    group.add_task(&member).unwrap();
    assert!(matches!(
        scheduler.execute(&member, Priority::Medium),
        Err(TaskPoolError::Validation(_))
    ));

    let other = scheduler.task_group("other");
    assert!(matches!(
        other.add_task(&member),
        Err(TaskPoolError::Validation(_))
    ));

    let long = scheduler.create_long_task("long", |_| Ok(json!(null)));
    assert!(matches!(
        group.add_task(&long),
        Err(TaskPoolError::Validation(_))
    ));

    group.execute(Priority::Medium).unwrap().wait().unwrap();
    let late = scheduler.create_task("late", |_| Ok(json!(null)));
    assert!(matches!(
        group.add_task(&late),
        Err(TaskPoolError::Validation(_))
    ));
}

#[test]
fn test_sequence_runner_keeps_submission_order() {
    let scheduler = pool(4, 4);
    let runner = scheduler.sequence_runner(Priority::Medium);
    let spans = Arc::new(Mutex::new(Vec::<(usize, Instant, Instant)>::new()));

    let mut handles = Vec::new();
    for index in 0..5usize {
        let spans = spans.clone();
        let task = scheduler.create_task(format!("step-{}", index), move |_| {
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(10));
            spans.lock().push((index, start, Instant::now()));
            Ok(json!(index))
        });
        handles.push(runner.execute(&task).unwrap());
    }
    for (index, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait().unwrap(), json!(index));
    }

    let spans = spans.lock();
    let order: Vec<usize> = spans.iter().map(|(index, _, _)| *index).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    for pair in spans.windows(2) {
        assert!(pair[0].2 <= pair[1].1, "step {} overlapped step {}", pair[0].0, pair[1].0);
    }
}

#[test]
fn test_sequence_failure_does_not_block_next() {
    let scheduler = pool(2, 2);
    let runner = scheduler.sequence_runner(Priority::High);
    let fails = scheduler.create_task("fails", |_| anyhow::bail!("first step failed"));
    let next = scheduler.create_task("next", |_| Ok(json!("next")));

    let first = runner.execute(&fails).unwrap();
    let second = runner.execute(&next).unwrap();
    assert!(first.wait().is_err());
    assert_eq!(second.wait().unwrap(), json!("next"));
    assert_eq!(next.runner_id(), Some(runner.id()));
}

#[test]
fn test_cancel_queued_sequence_member() {
    let scheduler = pool(2, 2);
    let runner = scheduler.sequence_runner(Priority::Medium);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);

    let head = scheduler.create_task("head", move |_| {
        let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
        Ok(json!("head"))
    });
    let skipped = scheduler.create_task("skipped", |_| Ok(json!("skipped")));
    let tail = scheduler.create_task("tail", |_| Ok(json!("tail")));

    let head_handle = runner.execute(&head).unwrap();
    let skipped_handle = runner.execute(&skipped).unwrap();
    let tail_handle = runner.execute(&tail).unwrap();
    assert_eq!(runner.current(), Some(head.id()));
    assert_eq!(runner.queued(), 2);

    scheduler.cancel(skipped.id()).unwrap();
    assert_eq!(runner.queued(), 1);
    release_tx.send(()).unwrap();

    assert_eq!(head_handle.wait().unwrap(), json!("head"));
    assert_eq!(skipped_handle.wait().unwrap_err(), TaskError::Canceled);
    assert_eq!(tail_handle.wait().unwrap(), json!("tail"));
}

#[test]
fn test_global_sequence_runner_is_shared_by_name() {
    let scheduler = pool(1, 1);
    let first = scheduler
        .global_sequence_runner("journal", Priority::Low)
        .unwrap();
    let second = scheduler
        .global_sequence_runner("journal", Priority::Low)
        .unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.name(), Some("journal"));

    assert!(matches!(
        scheduler.global_sequence_runner("journal", Priority::High),
        Err(TaskPoolError::Validation(_))
    ));

    let task = scheduler.create_task("entry", |_| Ok(json!("entry")));
    assert_eq!(second.execute(&task).unwrap().wait().unwrap(), json!("entry"));

    // Once every holder is gone the name is free for another priority
    drop(first);
    drop(second);
    let fresh = scheduler
        .global_sequence_runner("journal", Priority::High)
        .unwrap();
    assert_eq!(fresh.priority(), Priority::High);
}

#[test]
fn test_runner_member_cannot_move() {
    let scheduler = pool(1, 1);
    let a = scheduler.sequence_runner(Priority::Medium);
    let b = scheduler.sequence_runner(Priority::Medium);
    let task = scheduler.create_task("pinned", |_| Ok(json!(null)));

    a.execute(&task).unwrap().wait().unwrap();
    assert!(matches!(b.execute(&task), Err(TaskPoolError::Validation(_))));
    assert!(matches!(
        scheduler.execute(&task, Priority::Medium),
        Err(TaskPoolError::Validation(_))
    ));
    // The owning runner can run it again
    a.execute(&task).unwrap().wait().unwrap();
}
