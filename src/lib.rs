//! Safe concurrent execution of interdependent tasks.
//!
//! Given tasks with declared dependencies and touched resources, this
//! crate builds a dependency graph, detects cycles, partitions tasks into
//! dependency-safe parallel batches, executes them under bounded
//! concurrency with per-task branch/worktree isolation, tracks live
//! execution state with rollback checkpoints, and reconciles isolated
//! work back into a shared branch.

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod isolation;
pub mod state;
pub mod task;

pub use analyzer::DependencyAnalyzer;
pub use config::{ConductorConfig, EngineConfig, ExecutionMode, IsolationConfig, StateConfig};
pub use engine::{ExecutionEngine, ResourceLockTable, RunnerContext, TaskRunner};
pub use error::{ConductorError, Result};
pub use isolation::{IsolationManager, IsolationStatus, Reconciler};
pub use state::{ExecutionSnapshot, ExecutionStateMachine, GlobalState, TaskState};
pub use task::{
    Conflict, ConflictKind, DependencyAnalysis, ExecutionResult, RiskLevel, RunnerPayload,
    Severity, Task, TaskGroup,
};
