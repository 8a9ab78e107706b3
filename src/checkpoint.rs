use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::{PhaseResult, PipelineCheckpoint};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid id `{0}`: must be non-empty and contain no path separators")]
    InvalidId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, bead_id: &str, phase_results: &[PhaseResult]) -> Result<(), StoreError>;
    fn load(&self, bead_id: &str) -> Result<Option<PipelineCheckpoint>, StoreError>;
    fn remove(&self, bead_id: &str) -> Result<(), StoreError>;
}

/// Rejects anything that isn't a plain single path segment: empty, `.`, `..`,
/// or containing a path separator. Shared by every on-disk store keyed by a
/// bead/campaign id, since all of them join the id straight onto a base dir.
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id == "." || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// One JSON file per bead id under `<base>/checkpoints/`, written via the
/// write-tempfile-then-rename pattern so a crash never leaves a torn file.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileCheckpointStore {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, bead_id: &str) -> PathBuf {
        self.base_dir.join(format!("{bead_id}.checkpoint.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, bead_id: &str, phase_results: &[PhaseResult]) -> Result<(), StoreError> {
        validate_id(bead_id)?;
        fs::create_dir_all(&self.base_dir)?;

        let checkpoint = PipelineCheckpoint {
            bead_id: bead_id.to_string(),
            phase_results: phase_results.to_vec(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| StoreError::Corrupt { path: self.path_for(bead_id), source: e })?;

        let mut temp_file = NamedTempFile::new_in(&self.base_dir)?;
        temp_file.write_all(&contents)?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;

        let final_path = self.path_for(bead_id);
        temp_file.persist(&final_path).map_err(|e| e.error)?;

        // fsync the containing directory so the rename itself is durable.
        if let Ok(dir) = File::open(&self.base_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn load(&self, bead_id: &str) -> Result<Option<PipelineCheckpoint>, StoreError> {
        validate_id(bead_id)?;
        let path = self.path_for(bead_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let checkpoint = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt { path: path.clone(), source: e })?;
        Ok(Some(checkpoint))
    }

    fn remove(&self, bead_id: &str) -> Result<(), StoreError> {
        validate_id(bead_id)?;
        let path = self.path_for(bead_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn path_for_dir(dir: &Path, bead_id: &str) -> PathBuf {
    dir.join(format!("{bead_id}.checkpoint.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseStatusMarker;
    use std::time::Duration;

    fn sample_result(phase: &str) -> PhaseResult {
        PhaseResult {
            phase: phase.to_string(),
            attempt: 1,
            signal: None,
            status: PhaseStatusMarker::Pass,
            duration: Duration::from_secs(1),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let results = vec![sample_result("implement"), sample_result("review")];
        store.save("bead-1", &results).unwrap();

        let loaded = store.load("bead-1").unwrap().unwrap();
        assert_eq!(loaded.bead_id, "bead-1");
        assert_eq!(loaded.phase_results.len(), 2);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn remove_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save("bead-1", &[sample_result("implement")]).unwrap();
        store.remove("bead-1").unwrap();
        assert!(store.load("bead-1").unwrap().is_none());
    }

    #[test]
    fn rejects_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(matches!(
            store.save("../escape", &[]),
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(store.load(""), Err(StoreError::InvalidId(_))));
        assert!(matches!(store.load("."), Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn corrupt_file_surfaces_as_error_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        fs::write(path_for_dir(dir.path(), "bead-1"), b"not json").unwrap();
        assert!(matches!(store.load("bead-1"), Err(StoreError::Corrupt { .. })));
    }
}
