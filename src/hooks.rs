use async_trait::async_trait;

use crate::adapters::issue_tracker::IssueTracker;
use crate::adapters::worklog::Worklog;
use crate::adapters::worktree::{Worktree, WorktreeError};
use crate::log_warn;

/// Re-runs the execute/sign-off phase pair inside a conflicted worktree with
/// the conflict itself injected as reviewer feedback. Bounded by the hook's
/// `max_conflict_attempts`; a resolver that can't make the merge clean
/// within that budget leaves the worktree intact for a human.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, bead_id: &str, conflicted_files: &[String]) -> Result<(), String>;
}

pub struct PostPipelineHook<'a> {
    pub worktree: &'a dyn Worktree,
    pub worklog: &'a dyn Worklog,
    pub issue_tracker: &'a dyn IssueTracker,
    pub conflict_resolver: Option<&'a dyn ConflictResolver>,
    pub main_branch_override: Option<String>,
    /// Recommended default: 3.
    pub max_conflict_attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HookOutcome {
    Merged { head_sha: String },
    /// Merge failed and stayed unresolved; worktree/branch are left intact
    /// and the bead is not closed. The campaign's failure mode decides what
    /// happens next.
    UnresolvedConflict,
}

impl<'a> PostPipelineHook<'a> {
    /// Merge -> remove worktree -> close bead -> archive worklog. Each step
    /// is independent: a failed merge blocks everything after it, but a
    /// successful merge with a failed bead-close is only a warning. Safe to
    /// call again on a bead that was already fully cleaned up.
    pub async fn run(&self, bead_id: &str, commit_msg: &str) -> Result<HookOutcome, String> {
        let main_branch = match &self.main_branch_override {
            Some(b) => b.clone(),
            None => self
                .worktree
                .detect_main_branch()
                .await
                .map_err(|e| e.to_string())?,
        };

        let head_sha = match self.worktree.merge_to_main(bead_id, &main_branch, commit_msg).await {
            Ok(sha) => sha,
            Err(WorktreeError::MergeConflict(files)) => {
                match self
                    .resolve_and_retry_merge(bead_id, &main_branch, commit_msg, files)
                    .await
                {
                    Some(sha) => sha,
                    None => {
                        log_warn!(
                            "[hooks] unresolved merge conflict for bead `{bead_id}`; worktree left intact"
                        );
                        return Ok(HookOutcome::UnresolvedConflict);
                    }
                }
            }
            Err(e) => return Err(e.to_string()),
        };

        if let Err(e) = self.worktree.remove(bead_id, false).await {
            log_warn!("[hooks] failed to remove worktree for `{bead_id}`: {e}");
        }
        let _ = self.worktree.prune().await;

        // A failed bead-close is always a warning, never a task failure:
        // the merge already landed, so the work itself is not at risk.
        if let Err(e) = self.issue_tracker.close(bead_id).await {
            log_warn!("[hooks] failed to close bead `{bead_id}`: {e}");
        }

        if let Err(e) = self.worklog.archive(bead_id).await {
            log_warn!("[hooks] failed to archive worklog for `{bead_id}`: {e}");
        }

        Ok(HookOutcome::Merged { head_sha })
    }

    async fn resolve_and_retry_merge(
        &self,
        bead_id: &str,
        main_branch: &str,
        commit_msg: &str,
        mut conflicted_files: Vec<String>,
    ) -> Option<String> {
        let Some(resolver) = self.conflict_resolver else {
            let _ = self.worktree.abort_merge().await;
            return None;
        };

        for attempt in 1..=self.max_conflict_attempts {
            let _ = self.worktree.abort_merge().await;
            if let Err(e) = resolver.resolve(bead_id, &conflicted_files).await {
                log_warn!(
                    "[hooks] conflict resolution attempt {attempt}/{} for `{bead_id}` failed: {e}",
                    self.max_conflict_attempts
                );
                continue;
            }
            match self.worktree.merge_to_main(bead_id, main_branch, commit_msg).await {
                Ok(sha) => return Some(sha),
                Err(WorktreeError::MergeConflict(files)) => {
                    conflicted_files = files;
                    continue;
                }
                Err(e) => {
                    log_warn!("[hooks] merge retry {attempt} for `{bead_id}` errored: {e}");
                    continue;
                }
            }
        }
        let _ = self.worktree.abort_merge().await;
        None
    }
}
