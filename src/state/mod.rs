//! Execution state tracking: per-task state transitions, bounded snapshot
//! history with rollback, and change notification.

mod machine;
mod tracker;

pub use machine::{GlobalState, TaskState};
pub use tracker::{
    ExecutionSnapshot, ExecutionStateMachine, StateCounts, TaskStateSnapshot, TaskUpdate,
};
