use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Isolation not found: {0}")]
    IsolationNotFound(String),

    #[error("Isolation integrity check failed: {id}: {reason}")]
    IsolationIntegrity { id: String, reason: String },

    #[error("Invalid isolation status: expected {expected}, got {actual}")]
    InvalidIsolationStatus { expected: String, actual: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Worktree error: {message}")]
    Worktree { message: String, path: PathBuf },

    #[error("Merge conflict in isolation {isolation_id}: {detail}")]
    MergeConflict {
        isolation_id: String,
        detail: String,
    },

    #[error("Sync conflict in isolation {isolation_id}: {files:?}")]
    SyncConflict {
        isolation_id: String,
        files: Vec<String>,
    },

    #[error("No runner registered")]
    NoRunnerRegistered,

    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ConductorError>;
