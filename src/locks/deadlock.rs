//! Deadlock detection over the wait-for graph of lock requests.

use crate::locks::ThreadTag;
use crate::locks::graph::Graph;
use crate::locks::manager::LockInfo;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write;

/// `waiter` has a queued request on `lock`, which `holder` currently holds.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LockDependency {
    pub waiter: ThreadTag,
    pub holder: ThreadTag,
    pub lock: String,
}

/// One wait-for cycle. `locks[i]` is the lock `threads[i]` waits on, held by
/// `threads[(i + 1) % len]`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeadlockInfo {
    pub threads: Vec<ThreadTag>,
    pub locks: Vec<String>,
}

impl DeadlockInfo {
    pub fn involves(&self, thread: ThreadTag) -> bool {
        self.threads.contains(&thread)
    }
}

fn build_graph(dependencies: &[LockDependency]) -> Graph<ThreadTag, String> {
    let mut graph = Graph::new();
    for dep in dependencies {
        graph.add_edge(dep.waiter, dep.holder, dep.lock.clone());
    }
    graph
}

/// First cycle reachable from `thread` in the wait-for graph
pub fn find_deadlock(dependencies: &[LockDependency], thread: ThreadTag) -> Option<DeadlockInfo> {
    build_graph(dependencies)
        .find_cycle_from(thread)
        .map(|cycle| DeadlockInfo {
            threads: cycle.nodes,
            locks: cycle.edges,
        })
}

/// Every distinct cycle of the wait-for graph
pub fn check_deadlocks(dependencies: &[LockDependency]) -> Vec<DeadlockInfo> {
    let graph = build_graph(dependencies);
    let mut seen: BTreeSet<Vec<ThreadTag>> = BTreeSet::new();
    let mut found = Vec::new();

    for start in graph.nodes() {
        let Some(cycle) = graph.find_cycle_from(start) else {
            continue;
        };
        let mut key = cycle.nodes.clone();
        key.sort();
        if seen.insert(key) {
            found.push(DeadlockInfo {
                threads: cycle.nodes,
                locks: cycle.edges,
            });
        }
    }
    found
}

pub fn create_deadlock_warning_message(info: &DeadlockInfo) -> String {
    let mut message = String::from("Deadlock detected:");
    let len = info.threads.len();
    for (i, (thread, lock)) in info.threads.iter().zip(&info.locks).enumerate() {
        let holder = info.threads[(i + 1) % len];
        let separator = if i == 0 { " " } else { ", " };
        let _ = write!(
            message,
            "{}{} waits for '{}' held by {}",
            separator, thread, lock, holder
        );
    }
    message
}

/// Human-readable dump of lock snapshots, one block per lock
pub fn create_full_lock_infos_message(locks: &[LockInfo]) -> String {
    let mut message = String::new();
    for info in locks {
        let mode = info
            .mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "free".to_string());
        let _ = writeln!(message, "Lock '{}' ({}):", info.name, mode);
        for holder in &info.holders {
            let _ = writeln!(
                message,
                "  held by {} [{}] since {}",
                holder.thread,
                holder.mode,
                holder.since.to_rfc3339()
            );
        }
        for pending in &info.pending {
            let _ = writeln!(
                message,
                "  requested by {} [{}] since {}",
                pending.thread,
                pending.mode,
                pending.since.to_rfc3339()
            );
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{LockMode, LockRequestInfo};
    use chrono::Utc;

    fn dep(waiter: u64, holder: u64, lock: &str) -> LockDependency {
        LockDependency {
            waiter: ThreadTag::from_raw(waiter),
            holder: ThreadTag::from_raw(holder),
            lock: lock.to_string(),
        }
    }

    #[test]
    fn test_two_cycle_reports_both_threads() {
        let deps = vec![dep(1, 2, "a"), dep(2, 1, "b")];

        let found = check_deadlocks(&deps);
        assert_eq!(found.len(), 1);
        let info = &found[0];
        assert!(info.involves(ThreadTag::from_raw(1)));
        assert!(info.involves(ThreadTag::from_raw(2)));
        assert_eq!(info.threads.len(), 2);
        assert_eq!(info.locks, vec!["a".to_string(), "b".to_string()]);

        let from_two = find_deadlock(&deps, ThreadTag::from_raw(2)).unwrap();
        assert_eq!(from_two.threads[0], ThreadTag::from_raw(2));
    }

    #[test]
    fn test_acyclic_graph_is_empty() {
        let deps = vec![dep(1, 2, "a"), dep(2, 3, "b"), dep(1, 3, "c")];
        assert!(check_deadlocks(&deps).is_empty());
        assert!(find_deadlock(&deps, ThreadTag::from_raw(1)).is_none());
        assert!(check_deadlocks(&[]).is_empty());
    }

    #[test]
    fn test_warning_message() {
        let info = DeadlockInfo {
            threads: vec![ThreadTag::from_raw(1), ThreadTag::from_raw(2)],
            locks: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            create_deadlock_warning_message(&info),
            "Deadlock detected: thread-1 waits for 'a' held by thread-2, \
             thread-2 waits for 'b' held by thread-1"
        );
    }

    #[test]
    fn test_full_lock_infos_message() {
        let now = Utc::now();
        let infos = vec![LockInfo {
            name: "db".to_string(),
            mode: Some(LockMode::Exclusive),
            holders: vec![LockRequestInfo {
                request_id: 1,
                thread: ThreadTag::from_raw(4),
                mode: LockMode::Exclusive,
                since: now,
            }],
            pending: vec![LockRequestInfo {
                request_id: 2,
                thread: ThreadTag::from_raw(5),
                mode: LockMode::Shared,
                since: now,
            }],
        }];

        let message = create_full_lock_infos_message(&infos);
        assert!(message.starts_with("Lock 'db' (exclusive):"));
        assert!(message.contains("held by thread-4 [exclusive]"));
        assert!(message.contains("requested by thread-5 [shared]"));
    }
}
