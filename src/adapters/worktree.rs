use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum WorktreeError {
    #[error("git exited with {0:?}: {1}")]
    CommandFailed(Option<i32>, String),
    #[error("merge conflict in {0} worktrees")]
    MergeConflict(Vec<String>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set the pipeline/campaign runner need from the project's git
/// checkout. Deliberately thin — no rebase/push/fetch, those belong to the
/// repository's own collaboration workflow, not to this orchestrator.
#[async_trait]
pub trait Worktree: Send + Sync {
    async fn create(&self, bead_id: &str) -> Result<PathBuf, WorktreeError>;
    async fn exists(&self, bead_id: &str) -> Result<bool, WorktreeError>;
    async fn remove(&self, bead_id: &str, delete_branch: bool) -> Result<(), WorktreeError>;
    async fn prune(&self) -> Result<(), WorktreeError>;
    /// No-fast-forward merges the bead's branch into `main_branch`, returning the new HEAD sha.
    async fn merge_to_main(&self, bead_id: &str, main_branch: &str, commit_msg: &str) -> Result<String, WorktreeError>;
    async fn detect_main_branch(&self) -> Result<String, WorktreeError>;
    async fn is_merge_in_progress(&self) -> Result<bool, WorktreeError>;
    async fn conflicted_files(&self) -> Result<Vec<String>, WorktreeError>;
    async fn abort_merge(&self) -> Result<(), WorktreeError>;
    /// Filesystem path of the bead's worktree, whether or not it currently exists.
    fn path_for(&self, bead_id: &str) -> PathBuf;
}

/// Reference `Worktree` built on the `git` CLI, one worktree per bead under
/// `<base>/worktrees/<bead-id>`, branch name equal to the bead id.
pub struct GitWorktree {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorktree {
    pub fn new(repo_root: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        GitWorktree {
            repo_root: repo_root.into(),
            worktrees_dir: worktrees_dir.into(),
        }
    }

    fn worktree_path(&self, bead_id: &str) -> PathBuf {
        self.worktrees_dir.join(bead_id)
    }

    async fn git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        self.git_in(&self.repo_root, args).await
    }

    async fn git_in(&self, dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorktreeError::CommandFailed(
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Worktree for GitWorktree {
    async fn create(&self, bead_id: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.worktree_path(bead_id);
        self.git(&[
            "worktree",
            "add",
            "-b",
            bead_id,
            path.to_str().unwrap_or_default(),
        ])
        .await?;
        Ok(path)
    }

    async fn exists(&self, bead_id: &str) -> Result<bool, WorktreeError> {
        Ok(self.worktree_path(bead_id).is_dir())
    }

    async fn remove(&self, bead_id: &str, delete_branch: bool) -> Result<(), WorktreeError> {
        let path = self.worktree_path(bead_id);
        if path.is_dir() {
            self.git(&["worktree", "remove", "--force", path.to_str().unwrap_or_default()])
                .await?;
        }
        if delete_branch {
            // A branch that was never merged still deletes fine with -D; a
            // missing branch is not an error worth surfacing here.
            let _ = self.git(&["branch", "-D", bead_id]).await;
        }
        Ok(())
    }

    async fn prune(&self) -> Result<(), WorktreeError> {
        self.git(&["worktree", "prune"]).await?;
        Ok(())
    }

    async fn merge_to_main(
        &self,
        bead_id: &str,
        main_branch: &str,
        commit_msg: &str,
    ) -> Result<String, WorktreeError> {
        self.git(&["checkout", main_branch]).await?;
        let merge = self
            .git(&["merge", "--no-ff", "-m", commit_msg, bead_id])
            .await;
        if merge.is_err() {
            let conflicts = self.conflicted_files().await.unwrap_or_default();
            if !conflicts.is_empty() {
                return Err(WorktreeError::MergeConflict(conflicts));
            }
            return Err(merge.unwrap_err());
        }
        let sha = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn detect_main_branch(&self) -> Result<String, WorktreeError> {
        // `origin/HEAD` points at the remote's default branch when set up;
        // fall back to whichever of main/master actually exists locally.
        if let Ok(out) = self.git(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]).await {
            if let Some(name) = out.trim().strip_prefix("origin/") {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self
                .git(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{candidate}")])
                .await
                .is_ok()
            {
                return Ok(candidate.to_string());
            }
        }
        Err(WorktreeError::CommandFailed(None, "no main branch found".to_string()))
    }

    async fn is_merge_in_progress(&self) -> Result<bool, WorktreeError> {
        Ok(self.git(&["rev-parse", "--verify", "-q", "MERGE_HEAD"]).await.is_ok())
    }

    async fn conflicted_files(&self) -> Result<Vec<String>, WorktreeError> {
        let out = self.git(&["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn abort_merge(&self) -> Result<(), WorktreeError> {
        self.git(&["merge", "--abort"]).await?;
        Ok(())
    }

    fn path_for(&self, bead_id: &str) -> PathBuf {
        self.worktree_path(bead_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_is_scoped_under_the_base_dir() {
        let wt = GitWorktree::new("/repo", "/repo/.capsule/worktrees");
        assert_eq!(
            wt.worktree_path("bead-1"),
            PathBuf::from("/repo/.capsule/worktrees/bead-1")
        );
    }
}
