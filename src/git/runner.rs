use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ConductorError, Result};

/// Process-level git plumbing. Worktree, branch, and merge operations go
/// through the git binary; in-process inspection uses git2 where the
/// caller needs it.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(output)
    }

    pub async fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Returns false when there was nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool> {
        let output = self.run(&["commit", "-m", message]).await?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(false);
            }
            return Err(ConductorError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(true)
    }

    pub async fn checkout(&self, reference: &str) -> Result<()> {
        self.run_checked(&["checkout", reference]).await?;
        Ok(())
    }

    /// Merge with an explicit merge commit (no fast-forward collapse).
    pub async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run_checked(&["merge", "--no-ff", branch, "-m", message])
            .await?;
        Ok(())
    }

    pub async fn merge_abort(&self) -> Result<()> {
        self.run(&["merge", "--abort"]).await?;
        Ok(())
    }

    /// Rebase onto `base`. Returns false when the rebase hit conflicts; the
    /// rebase is aborted first so the worktree is left as it was.
    pub async fn rebase(&self, base: &str) -> Result<bool> {
        let output = self.run(&["rebase", base]).await?;

        if !output.status.success() {
            warn!(base = %base, "Rebase failed, aborting");
            self.run(&["rebase", "--abort"]).await?;
            return Ok(false);
        }

        Ok(true)
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    pub async fn current_branch(&self) -> Result<String> {
        let output = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    /// Commits ahead of and behind `base` for the given ref.
    pub async fn ahead_behind(&self, base: &str, reference: &str) -> Result<(usize, usize)> {
        let range = format!("{}...{}", base, reference);
        let output = self
            .run_checked(&["rev-list", "--left-right", "--count", &range])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok((ahead, behind))
    }

    /// Paths with uncommitted changes (staged, unstaged, or untracked).
    pub async fn dirty_files(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&["status", "--porcelain"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    /// Paths with unresolved conflict markers.
    pub async fn unmerged_files(&self) -> Result<Vec<String>> {
        let output = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Files changed on HEAD relative to the merge base with `base`,
    /// plus any uncommitted changes in the worktree.
    pub async fn changed_files_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{}...HEAD", base);
        let output = self.run_checked(&["diff", "--name-only", &range]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut files: Vec<String> = stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        for dirty in self.dirty_files().await? {
            if !files.contains(&dirty) {
                files.push(dirty);
            }
        }

        Ok(files)
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ConductorError::Other("Invalid path encoding".into()))?;

        let output = if self.branch_exists(branch).await? {
            self.run(&["worktree", "add", path_str, branch]).await?
        } else {
            self.run(&["worktree", "add", "-b", branch, path_str, base])
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Worktree {
                message: stderr.to_string(),
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ConductorError::Other("Invalid path encoding".into()))?;

        let output = self
            .run(&["worktree", "remove", "--force", path_str])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Worktree {
                message: stderr.to_string(),
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).await?;
        Ok(())
    }
}
