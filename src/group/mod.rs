//! Execution contracts over several tasks: task groups and sequence runners.

pub mod sequence_runner;
pub mod task_group;

pub use sequence_runner::SequenceRunner;
pub use task_group::TaskGroup;
