use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ConductorError, Result};

/// Hard ceiling on concurrently running tasks. Configured values are
/// clamped into [1, MAX_PARALLEL_TASKS].
pub const MAX_PARALLEL_TASKS: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub engine: EngineConfig,
    pub state: StateConfig,
    pub isolation: IsolationConfig,
}

impl ConductorConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("conductor.toml");
        let config: Self = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join("conductor.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ConductorError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.engine.max_parallel_tasks == 0 {
            errors.push("engine.max_parallel_tasks must be greater than 0");
        }
        if self.engine.task_timeout_secs == 0 {
            errors.push("engine.task_timeout_secs must be greater than 0");
        }
        if self.state.snapshot_capacity == 0 {
            errors.push("state.snapshot_capacity must be greater than 0");
        }
        if self.state.wait_poll_ms == 0 {
            errors.push("state.wait_poll_ms must be greater than 0");
        }
        if self.isolation.branch_prefix.is_empty() {
            errors.push("isolation.branch_prefix must not be empty");
        }
        if self.isolation.base_ref.is_empty() {
            errors.push("isolation.base_ref must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConductorError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Strictly sequential, fail-fast.
    Classic,
    /// Bounded-concurrency scheduling with resource locks.
    #[default]
    Turbo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_parallel_tasks: usize,
    pub task_timeout_secs: u64,
    pub mode: ExecutionMode,
    /// Turbo failure policy: a failed result stops new admissions. In-flight
    /// tasks always run to completion either way.
    pub halt_on_failure: bool,
    /// Whether a failed batch rolls the state machine back to the snapshot
    /// taken before the batch started. Off by default: partial completion
    /// stays inspectable. A user stop never rolls back.
    pub rollback_batch_on_failure: bool,
}

impl EngineConfig {
    /// Effective concurrency ceiling, clamped into [1, MAX_PARALLEL_TASKS].
    pub fn effective_parallelism(&self) -> usize {
        self.max_parallel_tasks.clamp(1, MAX_PARALLEL_TASKS)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: MAX_PARALLEL_TASKS,
            task_timeout_secs: 30,
            mode: ExecutionMode::Turbo,
            halt_on_failure: true,
            rollback_batch_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Bounded snapshot history, FIFO eviction.
    pub snapshot_capacity: usize,
    /// Poll interval for the task-wait primitive.
    pub wait_poll_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: 50,
            wait_poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Directory (relative to the repo root) holding per-task worktrees.
    pub worktrees_dir: String,
    pub branch_prefix: String,
    pub base_ref: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            worktrees_dir: ".conductor/worktrees".into(),
            branch_prefix: "task".into(),
            base_ref: "main".into(),
        }
    }
}
