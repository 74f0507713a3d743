use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::IsolationConfig;
use crate::error::{ConductorError, Result};
use crate::git::GitRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStatus {
    Active,
    Merging,
    Completed,
}

impl std::fmt::Display for IsolationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merging => write!(f, "merging"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A per-task isolated workspace: dedicated branch plus git worktree.
/// Owned exclusively by the task that created it until merge or destroy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Isolation {
    pub id: String,
    pub task_id: String,
    pub branch: String,
    pub path: PathBuf,
    pub base_ref: String,
    pub env: HashMap<String, String>,
    pub status: IsolationStatus,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time report of an isolation's relation to its base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationReport {
    pub clean: bool,
    pub ahead: usize,
    pub behind: usize,
    pub conflicts: Vec<String>,
}

/// Creates, destroys, syncs, and merges isolated worktrees rooted under a
/// single git repository.
pub struct IsolationManager {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    branch_prefix: String,
    base_ref: String,
    isolations: Mutex<HashMap<String, Isolation>>,
}

impl IsolationManager {
    pub fn new(repo_path: impl Into<PathBuf>, config: &IsolationConfig) -> Self {
        let repo_path = repo_path.into();
        Self {
            worktrees_dir: repo_path.join(&config.worktrees_dir),
            branch_prefix: config.branch_prefix.clone(),
            base_ref: config.base_ref.clone(),
            repo_path,
            isolations: Mutex::new(HashMap::new()),
        }
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_path)
    }

    pub fn default_base_ref(&self) -> &str {
        &self.base_ref
    }

    /// Creates an isolated branch + worktree for the task, derived from
    /// `base_ref`. Creation is atomic: any partial artifacts are destroyed
    /// before the error propagates.
    pub async fn create_isolated(&self, task_id: &str, base_ref: &str) -> Result<Isolation> {
        let short = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let id = format!("iso-{}-{}", task_id, short);
        let branch = format!("{}/{}-{}", self.branch_prefix, task_id, short);
        let path = self.worktrees_dir.join(&id);

        fs::create_dir_all(&self.worktrees_dir).await?;

        if let Err(e) = self.git().worktree_add(&path, &branch, base_ref).await {
            self.remove_partial(&path, &branch).await;
            return Err(e);
        }

        let mut env = HashMap::new();
        env.insert("CONDUCTOR_TASK_ID".to_string(), task_id.to_string());
        env.insert("CONDUCTOR_ISOLATION_ID".to_string(), id.clone());
        env.insert("CONDUCTOR_BRANCH".to_string(), branch.clone());

        let isolation = Isolation {
            id: id.clone(),
            task_id: task_id.to_string(),
            branch: branch.clone(),
            path: path.clone(),
            base_ref: base_ref.to_string(),
            env,
            status: IsolationStatus::Active,
            created_at: Utc::now(),
        };

        self.isolations.lock().insert(id.clone(), isolation.clone());

        info!(
            isolation_id = %id,
            task_id = %task_id,
            branch = %branch,
            path = %path.display(),
            "Created isolation"
        );

        Ok(isolation)
    }

    async fn remove_partial(&self, path: &Path, branch: &str) {
        if self.git().worktree_remove(path).await.is_err() && path.exists() {
            if let Err(e) = fs::remove_dir_all(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove partial worktree");
            }
        }
        let _ = self.git().worktree_prune().await;
        let _ = self.git().delete_branch(branch).await;
    }

    pub async fn destroy(&self, id: &str) -> Result<()> {
        let isolation = self
            .isolations
            .lock()
            .remove(id)
            .ok_or_else(|| ConductorError::IsolationNotFound(id.to_string()))?;

        self.remove_partial(&isolation.path, &isolation.branch).await;
        info!(isolation_id = %id, "Destroyed isolation");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Isolation> {
        self.isolations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ConductorError::IsolationNotFound(id.to_string()))
    }

    fn set_status(&self, id: &str, status: IsolationStatus) {
        if let Some(isolation) = self.isolations.lock().get_mut(id) {
            isolation.status = status;
        }
    }

    /// Rebases the isolation onto the latest state of its base ref. An
    /// unresolvable rebase is aborted and surfaced as a conflict; the
    /// isolation's changes are never discarded.
    pub async fn sync(&self, id: &str) -> Result<()> {
        let isolation = self.get(id)?;
        let git = GitRunner::new(&isolation.path);

        if git.rebase(&isolation.base_ref).await? {
            debug!(isolation_id = %id, base = %isolation.base_ref, "Synced isolation");
            return Ok(());
        }

        let files = git.changed_files_since(&isolation.base_ref).await?;
        Err(ConductorError::SyncConflict {
            isolation_id: id.to_string(),
            files,
        })
    }

    pub async fn status(&self, id: &str) -> Result<IsolationReport> {
        let isolation = self.get(id)?;
        let git = GitRunner::new(&isolation.path);

        let dirty = git.dirty_files().await?;
        let conflicts = git.unmerged_files().await?;
        let (ahead, behind) = git
            .ahead_behind(&isolation.base_ref, &isolation.branch)
            .await?;

        Ok(IsolationReport {
            clean: dirty.is_empty() && conflicts.is_empty(),
            ahead,
            behind,
            conflicts,
        })
    }

    /// Files this isolation changed relative to its base, committed or not.
    pub async fn changed_files(&self, id: &str) -> Result<Vec<String>> {
        let isolation = self.get(id)?;
        GitRunner::new(&isolation.path)
            .changed_files_since(&isolation.base_ref)
            .await
    }

    /// Stages and commits everything in the isolation's worktree.
    pub async fn commit_all(&self, id: &str, message: &str) -> Result<bool> {
        let isolation = self.get(id)?;
        let git = GitRunner::new(&isolation.path);
        git.add_all().await?;
        git.commit(message).await
    }

    /// Merges the isolation's branch into `target_ref` with an explicit
    /// merge commit referencing the originating task and isolation. A
    /// failed merge reverts the isolation to Active so it can be retried
    /// or inspected; it is never destroyed here.
    pub async fn merge_into(&self, id: &str, target_ref: &str) -> Result<()> {
        let isolation = self.get(id)?;
        if isolation.status != IsolationStatus::Active {
            return Err(ConductorError::InvalidIsolationStatus {
                expected: IsolationStatus::Active.to_string(),
                actual: isolation.status.to_string(),
            });
        }

        self.set_status(id, IsolationStatus::Merging);

        let git = self.git();
        let original_ref = git.current_branch().await?;
        let message = format!(
            "Merge task {} (isolation {})",
            isolation.task_id, isolation.id
        );

        let merge = async {
            git.checkout(target_ref).await?;
            git.merge_no_ff(&isolation.branch, &message).await
        };

        let outcome = match merge.await {
            Ok(()) => {
                self.set_status(id, IsolationStatus::Completed);
                info!(
                    isolation_id = %id,
                    task_id = %isolation.task_id,
                    target = %target_ref,
                    "Merged isolation"
                );
                Ok(())
            }
            Err(e) => {
                git.merge_abort().await?;
                self.set_status(id, IsolationStatus::Active);
                warn!(isolation_id = %id, error = %e, "Merge failed, isolation kept active");
                Err(ConductorError::MergeConflict {
                    isolation_id: id.to_string(),
                    detail: e.to_string(),
                })
            }
        };

        // The repo root goes back to whatever was checked out before.
        git.checkout(&original_ref).await?;
        outcome
    }

    pub fn list_all(&self) -> Vec<Isolation> {
        let mut all: Vec<Isolation> = self.isolations.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Directory must exist and the branch must resolve before an
    /// isolation is trusted in listings or merges.
    pub async fn validate_integrity(&self, id: &str) -> Result<()> {
        let isolation = self.get(id)?;

        if !isolation.path.exists() {
            return Err(ConductorError::IsolationIntegrity {
                id: id.to_string(),
                reason: format!("worktree missing: {}", isolation.path.display()),
            });
        }
        if !self.git().branch_exists(&isolation.branch).await? {
            return Err(ConductorError::IsolationIntegrity {
                id: id.to_string(),
                reason: format!("branch not resolvable: {}", isolation.branch),
            });
        }
        Ok(())
    }

    /// Destroys every isolation already in Completed status.
    pub async fn cleanup_completed(&self) -> Result<Vec<String>> {
        let completed: Vec<String> = self
            .isolations
            .lock()
            .values()
            .filter(|i| i.status == IsolationStatus::Completed)
            .map(|i| i.id.clone())
            .collect();

        let mut destroyed = Vec::new();
        for id in completed {
            self.destroy(&id).await?;
            destroyed.push(id);
        }
        Ok(destroyed)
    }
}
