use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::checkpoint::{validate_id, StoreError};
use crate::types::CampaignState;

pub trait CampaignStateStore: Send + Sync {
    fn save(&self, state: &CampaignState) -> Result<(), StoreError>;
    fn load(&self, parent_id: &str) -> Result<Option<CampaignState>, StoreError>;
    fn remove(&self, parent_id: &str) -> Result<(), StoreError>;
}

/// One JSON file per campaign (keyed by the parent bead id) under
/// `<base>/campaigns/`, same atomic write discipline as the checkpoint store.
pub struct FileCampaignStateStore {
    base_dir: PathBuf,
}

impl FileCampaignStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileCampaignStateStore {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, parent_id: &str) -> PathBuf {
        self.base_dir.join(format!("{parent_id}.json"))
    }
}

impl CampaignStateStore for FileCampaignStateStore {
    fn save(&self, state: &CampaignState) -> Result<(), StoreError> {
        validate_id(&state.parent_id)?;
        fs::create_dir_all(&self.base_dir)?;

        let contents = serde_json::to_vec_pretty(state).map_err(|e| StoreError::Corrupt {
            path: self.path_for(&state.parent_id),
            source: e,
        })?;

        let mut temp_file = NamedTempFile::new_in(&self.base_dir)?;
        temp_file.write_all(&contents)?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;

        let final_path = self.path_for(&state.parent_id);
        temp_file.persist(&final_path).map_err(|e| e.error)?;

        if let Ok(dir) = File::open(&self.base_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn load(&self, parent_id: &str) -> Result<Option<CampaignState>, StoreError> {
        validate_id(parent_id)?;
        let path = self.path_for(parent_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt { path: path.clone(), source: e })?;
        Ok(Some(state))
    }

    fn remove(&self, parent_id: &str) -> Result<(), StoreError> {
        validate_id(parent_id)?;
        let path = self.path_for(parent_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CampaignStatus;
    use chrono::Utc;

    fn sample_state() -> CampaignState {
        CampaignState {
            campaign_id: "epic-1".to_string(),
            parent_id: "epic-1".to_string(),
            tasks: vec![],
            current_task_idx: 0,
            consec_failures: 0,
            status: CampaignStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCampaignStateStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        let loaded = store.load("epic-1").unwrap().unwrap();
        assert_eq!(loaded.parent_id, "epic-1");
    }

    #[test]
    fn remove_deletes_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCampaignStateStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        store.remove("epic-1").unwrap();
        assert!(store.load("epic-1").unwrap().is_none());
    }

    #[test]
    fn rejects_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCampaignStateStore::new(dir.path());
        assert!(matches!(store.load("../x"), Err(StoreError::InvalidId(_))));
        assert!(matches!(store.load("."), Err(StoreError::InvalidId(_))));
    }
}
