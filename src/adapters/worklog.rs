use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorklogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set for the per-bead worklog: a running markdown transcript of
/// phase outcomes, created alongside the worktree and archived once the
/// post-pipeline hook closes the bead out.
#[async_trait]
pub trait Worklog: Send + Sync {
    async fn create(&self, bead_id: &str, bead_context: &str) -> Result<(), WorklogError>;
    async fn append(&self, bead_id: &str, phase: &str, outcome: &str, summary: &str) -> Result<(), WorklogError>;
    async fn archive(&self, bead_id: &str) -> Result<(), WorklogError>;
}

/// Reference implementation: one `worklog.md` per bead worktree, archived to
/// `<base>/logs/<bead-id>/worklog.md` on success. Mirrors the teacher's
/// append-one-entry-per-phase convention, but one file per bead rather than
/// a monthly rollup, per this system's simpler lifecycle.
pub struct FileWorklog {
    worktrees_dir: PathBuf,
    logs_dir: PathBuf,
}

impl FileWorklog {
    pub fn new(worktrees_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        FileWorklog {
            worktrees_dir: worktrees_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    fn active_path(&self, bead_id: &str) -> PathBuf {
        self.worktrees_dir.join(bead_id).join("worklog.md")
    }

    fn archive_dir(&self, bead_id: &str) -> PathBuf {
        self.logs_dir.join(bead_id)
    }
}

#[async_trait]
impl Worklog for FileWorklog {
    async fn create(&self, bead_id: &str, bead_context: &str) -> Result<(), WorklogError> {
        let path = self.active_path(bead_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let header = format!(
            "# Worklog for {bead_id}\n\n_Created {}_\n\n{bead_context}\n\n---\n\n",
            Utc::now().to_rfc3339()
        );
        fs::write(&path, header)?;
        Ok(())
    }

    async fn append(&self, bead_id: &str, phase: &str, outcome: &str, summary: &str) -> Result<(), WorklogError> {
        let path = self.active_path(bead_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        writeln!(
            file,
            "## {} — {phase} ({outcome})\n\n{summary}\n",
            Utc::now().to_rfc3339()
        )?;
        Ok(())
    }

    async fn archive(&self, bead_id: &str) -> Result<(), WorklogError> {
        let src = self.active_path(bead_id);
        if !src.exists() {
            return Ok(());
        }
        let dest_dir = self.archive_dir(bead_id);
        fs::create_dir_all(&dest_dir)?;
        fs::rename(&src, dest_dir.join("worklog.md"))?;
        Ok(())
    }
}

pub fn relative_worklog_path(logs_dir: &Path, base: &Path, bead_id: &str) -> PathBuf {
    logs_dir
        .join(bead_id)
        .join("worklog.md")
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| logs_dir.join(bead_id).join("worklog.md"))
}
