use crate::error::{TaskError, TaskPoolError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Value produced by a successful task body
pub type TaskValue = serde_json::Value;

/// Terminal result of one task execution
pub type TaskOutcome = Result<TaskValue, TaskError>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for tasks. `0` is never assigned.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this id was handed out by this process
    pub(crate) fn was_issued(self) -> bool {
        self.0 != 0 && self.0 < NEXT_TASK_ID.load(Ordering::Relaxed)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a task group
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Identifier of a sequence runner
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnerId(u64);

impl RunnerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

/// Dispatch priority. Lanes are served strictly in declaration order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
    Idle = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    /// All priorities from highest to lowest
    pub const ALL: [Priority; Priority::COUNT] =
        [Priority::High, Priority::Medium, Priority::Low, Priority::Idle];

    pub(crate) fn lane(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Idle => "idle",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u32> for Priority {
    type Error = TaskPoolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Medium),
            2 => Ok(Priority::Low),
            3 => Ok(Priority::Idle),
            other => Err(TaskPoolError::validation(format!(
                "priority value {} is out of range (0..={})",
                other,
                Priority::COUNT - 1
            ))),
        }
    }
}

impl FromStr for Priority {
    type Err = TaskPoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "idle" => Ok(Priority::Idle),
            other => match other.parse::<u32>() {
                Ok(raw) => Priority::try_from(raw),
                Err(_) => Err(TaskPoolError::validation(format!(
                    "unknown priority '{}'",
                    s
                ))),
            },
        }
    }
}

/// How a task entered the pool
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Explicitly constructed task
    Plain = 0,
    /// Anonymous task created by `submit`
    Function = 1,
    GroupMember = 2,
    SequenceMember = 3,
    Periodic = 4,
    /// Exempt from blocked-worker detection; runs at most once
    LongRunning = 5,
}

impl TaskType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskType::Plain,
            1 => TaskType::Function,
            2 => TaskType::GroupMember,
            3 => TaskType::SequenceMember,
            4 => TaskType::Periodic,
            5 => TaskType::LongRunning,
            other => unreachable!("invalid task type tag {other}"),
        }
    }
}

/// Execution state of a task (also reused for task group lifecycles)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Never executed
    NotFound = 0,
    Waiting = 1,
    Running = 2,
    Canceled = 3,
    Finished = 4,
    /// Waiting for its delay timer
    Delayed = 5,
    /// Periodic task cancelled during its final iteration
    Ending = 6,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::NotFound,
            1 => TaskState::Waiting,
            2 => TaskState::Running,
            3 => TaskState::Canceled,
            4 => TaskState::Finished,
            5 => TaskState::Delayed,
            6 => TaskState::Ending,
            other => unreachable!("invalid task state tag {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Canceled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::NotFound => "not_found",
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Canceled => "canceled",
            TaskState::Finished => "finished",
            TaskState::Delayed => "delayed",
            TaskState::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding a [`TaskState`]
#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition `from -> to`; on failure returns the state actually observed
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }
}

/// Lock-free cell holding a [`TaskType`]
#[derive(Debug)]
pub(crate) struct AtomicTaskType(AtomicU8);

impl AtomicTaskType {
    pub(crate) fn new(kind: TaskType) -> Self {
        Self(AtomicU8::new(kind as u8))
    }

    pub(crate) fn load(&self) -> TaskType {
        TaskType::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, kind: TaskType) {
        self.0.store(kind as u8, Ordering::Release);
    }
}

/// Which duration counter to read
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DurationKind {
    /// From enqueue to the start of the body
    Queued,
    /// Wall time spent in the body
    Cpu,
    /// Completion bookkeeping after the body returned
    Io,
    /// Sum of the three
    Total,
}

/// Duration counters of the latest execution of a task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskDurations {
    pub queued: Duration,
    pub cpu: Duration,
    pub io: Duration,
}

impl TaskDurations {
    pub fn get(&self, kind: DurationKind) -> Duration {
        match kind {
            DurationKind::Queued => self.queued,
            DurationKind::Cpu => self.cpu,
            DurationKind::Io => self.io,
            DurationKind::Total => self.queued + self.cpu + self.io,
        }
    }
}
