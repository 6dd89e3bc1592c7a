use crate::task::{Priority, TaskId};
use std::collections::VecDeque;

/// One FIFO lane per priority
#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    lanes: [VecDeque<TaskId>; Priority::COUNT],
}

impl ReadyQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, priority: Priority, id: TaskId) {
        self.lanes[priority.lane()].push_back(id);
    }

    /// Pop the oldest task of the highest non-empty lane. The IDLE lane is only
    /// considered when `allow_idle` is set.
    pub(crate) fn pop(&mut self, allow_idle: bool) -> Option<TaskId> {
        for priority in Priority::ALL {
            if priority == Priority::Idle && !allow_idle {
                break;
            }
            if let Some(id) = self.lanes[priority.lane()].pop_front() {
                return Some(id);
            }
        }
        None
    }

    /// Remove a queued task wherever it is. Returns whether it was queued.
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|queued| *queued == id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Number of queued tasks a worker could take right now
    pub(crate) fn dispatchable(&self, allow_idle: bool) -> usize {
        if allow_idle {
            self.len()
        } else {
            self.len() - self.lane_len(Priority::Idle)
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<TaskId> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }
}
