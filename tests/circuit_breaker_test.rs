mod common;

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use capsule::adapters::issue_tracker::{CreateBeadInput, IssueTracker, YamlIssueTracker};
use capsule::campaign::{run_campaign, CampaignConfig, CampaignError, TaskRunner};
use capsule::campaign_state::{CampaignStateStore, FileCampaignStateStore};
use capsule::types::{CampaignStatus, FailureMode, IssueType, PhaseResult, TaskStatus};

struct AlwaysFailRunner {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskRunner for AlwaysFailRunner {
    async fn run_task(&self, bead_id: &str) -> Result<Vec<PhaseResult>, String> {
        self.calls.lock().unwrap().push(bead_id.to_string());
        Err("simulated task failure".to_string())
    }
}

/// Scenario 5: three tasks, the first two fail, circuit breaker threshold 2.
/// Beyond what `campaign.rs`'s own unit test already covers (the error
/// variant and the call count), this checks what's actually left on disk:
/// the persisted `CampaignState` must record exactly the first two tasks as
/// failed and stop there, so a later `capsule campaign` invocation resuming
/// from this state file sees the same picture.
#[tokio::test]
async fn circuit_breaker_persists_only_the_failed_tasks_it_ran() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = YamlIssueTracker::new(dir.path().join("beads.yaml"));
    let parent = tracker
        .create(CreateBeadInput { title: "Epic".to_string(), issue_type: IssueType::Epic, ..Default::default() })
        .await
        .unwrap();

    let mut children = Vec::new();
    for i in 0..3 {
        let id = tracker
            .create(CreateBeadInput {
                title: format!("Task {i}"),
                issue_type: IssueType::Task,
                parent_id: Some(parent.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        children.push(id);
    }

    let state_store = FileCampaignStateStore::new(dir.path().join("campaigns"));
    let runner = AlwaysFailRunner { calls: Mutex::new(Vec::new()) };
    let cfg = CampaignConfig {
        issue_tracker: &tracker,
        state_store: &state_store,
        task_runner: &runner,
        post_task_hook: None,
        validation_phase: None,
        failure_mode: FailureMode::Continue,
        circuit_breaker: 2,
    };
    let mut visited = HashSet::new();
    let cancel = tokio_util::sync::CancellationToken::new();
    let err = run_campaign(&cfg, &parent, 0, &mut visited, &cancel).await.unwrap_err();
    assert!(matches!(err, CampaignError::CircuitBroken { count: 2, .. }));

    // The third task's runner is never invoked.
    assert_eq!(*runner.calls.lock().unwrap(), children[0..2].to_vec());

    let persisted = state_store.load(&parent).unwrap().expect("state should have been saved");
    assert_eq!(persisted.status, CampaignStatus::Failed);
    assert_eq!(persisted.current_task_idx, 2);
    assert_eq!(persisted.tasks.len(), 2);
    assert!(persisted.tasks.iter().all(|t| t.status == TaskStatus::Failed));
    assert_eq!(
        persisted.tasks.iter().map(|t| t.bead_id.clone()).collect::<Vec<_>>(),
        children[0..2].to_vec()
    );
}
