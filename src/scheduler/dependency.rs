use crate::error::{Result, TaskPoolError};
use crate::task::TaskId;
use std::collections::{HashMap, HashSet};

/// Bidirectional dependency tables.
///
/// `depends_on[t]` holds the unresolved dependencies of `t`, `dependents[d]`
/// the tasks waiting on `d`. Both maps always describe the same edge set.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    depends_on: HashMap<TaskId, HashSet<TaskId>>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    /// Admitted tasks held back until their dependencies resolve
    withheld: HashSet<TaskId>,
    /// Not-yet-admitted tasks whose dependency already failed
    failures: HashMap<TaskId, TaskId>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `task` depends on `dependency`
    pub(crate) fn add(&mut self, task: TaskId, dependency: TaskId) -> Result<()> {
        if task == dependency {
            return Err(TaskPoolError::validation(format!(
                "task {} cannot depend on itself",
                task
            )));
        }
        if self.reaches(dependency, task) {
            return Err(TaskPoolError::validation(format!(
                "dependency {} -> {} would create a cycle",
                task, dependency
            )));
        }
        self.depends_on.entry(task).or_default().insert(dependency);
        self.dependents.entry(dependency).or_default().insert(task);
        Ok(())
    }

    /// Remove one edge. Returns false when the edge did not exist.
    pub(crate) fn remove(&mut self, task: TaskId, dependency: TaskId) -> bool {
        let removed = match self.depends_on.get_mut(&task) {
            Some(deps) => deps.remove(&dependency),
            None => false,
        };
        if removed {
            if self.depends_on.get(&task).is_some_and(HashSet::is_empty) {
                self.depends_on.remove(&task);
            }
            if let Some(waiting) = self.dependents.get_mut(&dependency) {
                waiting.remove(&task);
                if waiting.is_empty() {
                    self.dependents.remove(&dependency);
                }
            }
        }
        removed
    }

    pub(crate) fn has_pending(&self, task: TaskId) -> bool {
        self.depends_on.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub(crate) fn has_edges(&self, task: TaskId) -> bool {
        self.has_pending(task) || self.dependents.contains_key(&task)
    }

    pub(crate) fn dependencies_of(&self, task: TaskId) -> Vec<TaskId> {
        let mut deps: Vec<TaskId> = self
            .depends_on
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    pub(crate) fn withhold(&mut self, task: TaskId) {
        self.withheld.insert(task);
    }

    /// Take a task out of the withheld set. Returns whether it was withheld.
    pub(crate) fn release_withheld(&mut self, task: TaskId) -> bool {
        self.withheld.remove(&task)
    }

    /// Release a withheld task whose dependency set is empty
    pub(crate) fn take_if_ready(&mut self, task: TaskId) -> bool {
        if !self.has_pending(task) && self.withheld.contains(&task) {
            self.withheld.remove(&task);
            return true;
        }
        false
    }

    pub(crate) fn withheld_tasks(&self) -> Vec<TaskId> {
        self.withheld.iter().copied().collect()
    }

    /// `done` finished successfully. Drops its outgoing edges and returns the
    /// withheld dependents that became eligible, each exactly once.
    pub(crate) fn resolve(&mut self, done: TaskId) -> Vec<TaskId> {
        let mut ready = Vec::new();
        let Some(waiting) = self.dependents.remove(&done) else {
            return ready;
        };
        for task in waiting {
            if let Some(deps) = self.depends_on.get_mut(&task) {
                deps.remove(&done);
                if deps.is_empty() {
                    self.depends_on.remove(&task);
                    if self.withheld.remove(&task) {
                        ready.push(task);
                    }
                }
            }
        }
        ready.sort();
        ready
    }

    /// `failed` ended without success. Withheld dependents are returned for
    /// rejection; dependents that were never admitted remember the failure.
    pub(crate) fn fail(&mut self, failed: TaskId) -> Vec<TaskId> {
        let mut rejected = Vec::new();
        let Some(waiting) = self.dependents.remove(&failed) else {
            return rejected;
        };
        for task in waiting {
            if self.withheld.contains(&task) {
                self.forget(task);
                rejected.push(task);
            } else {
                if let Some(deps) = self.depends_on.get_mut(&task) {
                    deps.remove(&failed);
                    if deps.is_empty() {
                        self.depends_on.remove(&task);
                    }
                }
                self.failures.insert(task, failed);
            }
        }
        rejected.sort();
        rejected
    }

    /// Failed dependency recorded for a task that was not admitted yet
    pub(crate) fn take_failure(&mut self, task: TaskId) -> Option<TaskId> {
        self.failures.remove(&task)
    }

    /// Drop every incoming dependency edge of `task` and its withheld or
    /// failure marks. Edges from its own dependents are kept.
    pub(crate) fn forget(&mut self, task: TaskId) {
        if let Some(deps) = self.depends_on.remove(&task) {
            for dependency in deps {
                if let Some(waiting) = self.dependents.get_mut(&dependency) {
                    waiting.remove(&task);
                    if waiting.is_empty() {
                        self.dependents.remove(&dependency);
                    }
                }
            }
        }
        self.withheld.remove(&task);
        self.failures.remove(&task);
    }

    /// Whether `to` is reachable from `from` following `depends_on` edges
    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(deps) = self.depends_on.get(&current) {
                stack.extend(deps.iter().copied());
            }
        }
        false
    }
}
