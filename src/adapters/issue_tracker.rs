use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::{Bead, BeadStatus, IssueType};

#[derive(Error, Debug)]
pub enum IssueTrackerError {
    #[error("bead `{0}` not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed store: {0}")]
    Serde(#[from] serde_yaml_ng::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BeadSummary {
    pub id: String,
    pub title: String,
    pub issue_type: IssueType,
    pub priority: u8,
}

#[derive(Clone, Debug, Default)]
pub struct CreateBeadInput {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub issue_type: IssueType,
    pub priority: u8,
    pub parent_id: Option<String>,
}

/// Capability set exposed to the campaign runner / CLI for the external
/// issue tracker. Kept deliberately small so it doesn't leak a particular
/// tracker CLI's idioms.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn ready(&self, parent_id: &str) -> Result<Vec<BeadSummary>, IssueTrackerError>;
    async fn resolve(&self, id: &str) -> Result<Bead, IssueTrackerError>;
    async fn close(&self, id: &str) -> Result<(), IssueTrackerError>;
    async fn create(&self, input: CreateBeadInput) -> Result<String, IssueTrackerError>;
}

#[derive(Serialize, Deserialize, Default)]
struct Store {
    #[serde(default)]
    beads: Vec<Bead>,
}

/// Reference `IssueTracker` backed by a single YAML file, following the
/// teacher's backlog-file shape (one document, atomic tempfile-then-rename
/// writes) instead of a database or a real tracker CLI.
pub struct YamlIssueTracker {
    path: PathBuf,
}

impl YamlIssueTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        YamlIssueTracker { path: path.into() }
    }

    fn load(&self) -> Result<Store, IssueTrackerError> {
        if !self.path.exists() {
            return Ok(Store::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_yaml_ng::from_str(&contents)?)
    }

    fn save(&self, store: &Store) -> Result<(), IssueTrackerError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        fs::create_dir_all(parent)?;
        let contents = serde_yaml_ng::to_string(store)?;

        let mut temp_file = NamedTempFile::new_in(parent)?;
        temp_file.write_all(contents.as_bytes())?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(&self.path).map_err(|e| e.error)?;

        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// `<parent>.<n+1>` for a child, or `item-<n+1>` at the top level.
    fn next_id(&self, store: &Store, parent_id: Option<&str>) -> String {
        let prefix = parent_id.map(|p| format!("{p}.")).unwrap_or_else(|| "item-".to_string());
        let max_suffix = store
            .beads
            .iter()
            .filter_map(|b| b.id.strip_prefix(&prefix))
            .filter_map(|rest| rest.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("{prefix}{}", max_suffix + 1)
    }
}

#[async_trait]
impl IssueTracker for YamlIssueTracker {
    async fn ready(&self, parent_id: &str) -> Result<Vec<BeadSummary>, IssueTrackerError> {
        let store = self.load()?;
        let mut children: Vec<&Bead> = store
            .beads
            .iter()
            .filter(|b| b.parent_id.as_deref() == Some(parent_id) && b.status != BeadStatus::Closed)
            .collect();
        children.retain(|b| {
            b.dependencies
                .iter()
                .all(|dep| store.beads.iter().any(|d| d.id == *dep && d.status == BeadStatus::Closed))
        });
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children
            .into_iter()
            .map(|b| BeadSummary {
                id: b.id.clone(),
                title: b.title.clone(),
                issue_type: b.issue_type.clone(),
                priority: b.priority,
            })
            .collect())
    }

    async fn resolve(&self, id: &str) -> Result<Bead, IssueTrackerError> {
        let store = self.load()?;
        store
            .beads
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| IssueTrackerError::NotFound(id.to_string()))
    }

    async fn close(&self, id: &str) -> Result<(), IssueTrackerError> {
        let mut store = self.load()?;
        let bead = store
            .beads
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| IssueTrackerError::NotFound(id.to_string()))?;
        bead.status = BeadStatus::Closed;
        bead.updated = Utc::now();
        self.save(&store)
    }

    async fn create(&self, input: CreateBeadInput) -> Result<String, IssueTrackerError> {
        let mut store = self.load()?;
        let id = self.next_id(&store, input.parent_id.as_deref());
        let now = Utc::now();
        store.beads.push(Bead {
            id: id.clone(),
            title: input.title,
            description: input.description,
            acceptance_criteria: input.acceptance_criteria,
            issue_type: input.issue_type,
            status: BeadStatus::Open,
            priority: input.priority,
            parent_id: input.parent_id,
            dependencies: vec![],
            created: now,
            updated: now,
        });
        self.save(&store)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (tempfile::TempDir, YamlIssueTracker) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = YamlIssueTracker::new(dir.path().join("beads.yaml"));
        (dir, tracker)
    }

    #[tokio::test]
    async fn create_then_resolve_round_trips() {
        let (_dir, tracker) = tracker();
        let id = tracker
            .create(CreateBeadInput {
                title: "Do the thing".to_string(),
                issue_type: IssueType::Task,
                ..Default::default()
            })
            .await
            .unwrap();
        let bead = tracker.resolve(&id).await.unwrap();
        assert_eq!(bead.title, "Do the thing");
        assert_eq!(bead.status, BeadStatus::Open);
    }

    #[tokio::test]
    async fn resolve_missing_is_not_found() {
        let (_dir, tracker) = tracker();
        assert!(matches!(
            tracker.resolve("nope").await,
            Err(IssueTrackerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_marks_bead_closed() {
        let (_dir, tracker) = tracker();
        let id = tracker
            .create(CreateBeadInput {
                title: "x".to_string(),
                issue_type: IssueType::Task,
                ..Default::default()
            })
            .await
            .unwrap();
        tracker.close(&id).await.unwrap();
        assert_eq!(tracker.resolve(&id).await.unwrap().status, BeadStatus::Closed);
    }

    #[tokio::test]
    async fn ready_excludes_children_with_unmet_dependencies() {
        let (_dir, tracker) = tracker();
        let parent = tracker
            .create(CreateBeadInput {
                title: "Epic".to_string(),
                issue_type: IssueType::Epic,
                ..Default::default()
            })
            .await
            .unwrap();
        let dep = tracker
            .create(CreateBeadInput {
                title: "Dep".to_string(),
                issue_type: IssueType::Task,
                parent_id: Some(parent.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let blocked = tracker
            .create(CreateBeadInput {
                title: "Blocked".to_string(),
                issue_type: IssueType::Task,
                parent_id: Some(parent.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        {
            let mut store = tracker.load().unwrap();
            store
                .beads
                .iter_mut()
                .find(|b| b.id == blocked)
                .unwrap()
                .dependencies = vec![dep.clone()];
            tracker.save(&store).unwrap();
        }

        let ready = tracker.ready(&parent).await.unwrap();
        assert_eq!(ready.iter().map(|s| s.id.clone()).collect::<Vec<_>>(), vec![dep]);

        tracker.close(&ready[0].id).await.unwrap();
        let ready_after = tracker.ready(&parent).await.unwrap();
        assert_eq!(ready_after.len(), 1);
        assert_eq!(ready_after[0].id, blocked);
    }
}
