use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::adapters::issue_tracker::{IssueTracker, IssueTrackerError};
use crate::campaign_state::CampaignStateStore;
use crate::checkpoint::StoreError;
use crate::types::{CampaignState, CampaignStatus, FailureMode, IssueType, PhaseResult, TaskResult, TaskStatus};
use crate::{log_info, log_warn};

/// Recursion never goes deeper than epic -> feature -> task.
const DEPTH_LIMIT: usize = 3;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("no ready children under `{0}`")]
    NoTasks(String),
    #[error("circuit breaker tripped after {count} consecutive failures: {failing_ids:?}")]
    CircuitBroken { count: u32, failing_ids: Vec<String> },
    #[error("recursion depth limit ({DEPTH_LIMIT}) exceeded or cycle detected at `{0}`")]
    DepthOrCycle(String),
    #[error("cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("issue tracker error: {0}")]
    IssueTracker(#[from] IssueTrackerError),
}

/// Runs the pipeline for a single non-composite bead. Implemented by
/// whatever wires up `pipeline::run_pipeline` with a worktree, a provider
/// registry, and an observer; kept abstract here so campaign recursion
/// doesn't need to know about any of that. The returned phase results feed
/// the task's `TaskResult.phase_results` in campaign state.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, bead_id: &str) -> Result<Vec<PhaseResult>, String>;
}

pub enum PostTaskOutcome {
    Ok,
    Warning(String),
    UnresolvedMergeConflict,
}

/// Invoked after every task boundary (success or failure). A merge conflict
/// that can't be resolved escalates the task to failed regardless of its
/// pipeline result; any other hook failure is logged as a warning.
#[async_trait]
pub trait PostTaskHook: Send + Sync {
    async fn on_task_complete(&self, bead_id: &str, task_succeeded: bool) -> PostTaskOutcome;
}

/// Runs once after all of a feature/epic's children complete, against the
/// feature/epic bead itself. A failure here fails the whole campaign.
#[async_trait]
pub trait ValidationPhase: Send + Sync {
    async fn validate(&self, parent_id: &str) -> Result<(), String>;
}

pub struct CampaignConfig<'a> {
    pub issue_tracker: &'a dyn IssueTracker,
    pub state_store: &'a dyn CampaignStateStore,
    pub task_runner: &'a dyn TaskRunner,
    pub post_task_hook: Option<&'a dyn PostTaskHook>,
    pub validation_phase: Option<&'a dyn ValidationPhase>,
    pub failure_mode: FailureMode,
    /// 0 disables the circuit breaker.
    pub circuit_breaker: u32,
}

fn new_state(parent_id: &str) -> CampaignState {
    CampaignState {
        campaign_id: parent_id.to_string(),
        parent_id: parent_id.to_string(),
        tasks: vec![],
        current_task_idx: 0,
        consec_failures: 0,
        status: CampaignStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
    }
}

/// Recurse into `parent_id`'s ready children in order, running each task
/// (or recursing further for feature/epic children), honoring the circuit
/// breaker and failure mode, and persisting state after every boundary.
pub async fn run_campaign<'a>(
    cfg: &CampaignConfig<'a>,
    parent_id: &str,
    depth: usize,
    visited: &mut HashSet<String>,
    cancel: &CancellationToken,
) -> Result<CampaignState, CampaignError> {
    if depth > DEPTH_LIMIT || !visited.insert(parent_id.to_string()) {
        return Err(CampaignError::DepthOrCycle(parent_id.to_string()));
    }

    let ready = cfg.issue_tracker.ready(parent_id).await?;
    if ready.is_empty() {
        return Err(CampaignError::NoTasks(parent_id.to_string()));
    }

    let mut state = cfg
        .state_store
        .load(parent_id)?
        .unwrap_or_else(|| new_state(parent_id));
    let mut failing_ids: Vec<String> = Vec::new();

    for (idx, summary) in ready.iter().enumerate() {
        if idx < state.current_task_idx {
            continue;
        }

        if cancel.is_cancelled() {
            state.status = CampaignStatus::Paused;
            cfg.state_store.save(&state)?;
            return Err(CampaignError::Cancelled);
        }

        log_info!("[campaign] starting task `{}` ({}/{})", summary.id, idx + 1, ready.len());
        let started = Instant::now();

        let run_result: Result<Vec<PhaseResult>, String> = if summary.issue_type == IssueType::Feature
            || summary.issue_type == IssueType::Epic
        {
            match Box::pin(run_campaign(cfg, &summary.id, depth + 1, visited, cancel)).await {
                Ok(child_state) if child_state.status == CampaignStatus::Completed => Ok(vec![]),
                Ok(child_state) => Err(format!("child campaign ended as {:?}", child_state.status)),
                Err(e) => Err(e.to_string()),
            }
        } else {
            cfg.task_runner.run_task(&summary.id).await
        };

        let mut succeeded = run_result.is_ok();
        let phase_results = run_result.as_ref().cloned().unwrap_or_default();
        let mut error_detail = run_result.err();

        if let Some(hook) = cfg.post_task_hook {
            match hook.on_task_complete(&summary.id, succeeded).await {
                PostTaskOutcome::Ok => {}
                PostTaskOutcome::Warning(msg) => {
                    log_warn!("[campaign] post-task hook warning for `{}`: {msg}", summary.id);
                }
                PostTaskOutcome::UnresolvedMergeConflict => {
                    succeeded = false;
                    error_detail = Some("unresolved merge conflict".to_string());
                }
            }
        }

        state.tasks.push(TaskResult {
            bead_id: summary.id.clone(),
            status: if succeeded { TaskStatus::Completed } else { TaskStatus::Failed },
            error_detail: error_detail.clone(),
            phase_results,
            duration: started.elapsed().max(Duration::from_millis(0)),
        });

        if succeeded {
            state.consec_failures = 0;
        } else {
            state.consec_failures += 1;
            failing_ids.push(summary.id.clone());

            if cfg.circuit_breaker > 0 && state.consec_failures >= cfg.circuit_breaker {
                state.status = CampaignStatus::Failed;
                cfg.state_store.save(&state)?;
                return Err(CampaignError::CircuitBroken {
                    count: state.consec_failures,
                    failing_ids,
                });
            }
        }

        state.current_task_idx = idx + 1;
        cfg.state_store.save(&state)?;

        if !succeeded {
            match cfg.failure_mode {
                FailureMode::Abort => {
                    state.status = CampaignStatus::Failed;
                    cfg.state_store.save(&state)?;
                    return Ok(state);
                }
                FailureMode::PauseOnFail => {
                    state.status = CampaignStatus::Paused;
                    cfg.state_store.save(&state)?;
                    return Ok(state);
                }
                FailureMode::Continue => {}
            }
        }
    }

    if let Some(validation) = cfg.validation_phase {
        if let Err(e) = validation.validate(parent_id).await {
            state.status = CampaignStatus::Failed;
            cfg.state_store.save(&state)?;
            log_warn!("[campaign] validation phase failed for `{parent_id}`: {e}");
            return Ok(state);
        }
    }

    state.status = CampaignStatus::Completed;
    state.completed_at = Some(Utc::now());
    cfg.state_store.save(&state)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::issue_tracker::{CreateBeadInput, YamlIssueTracker};
    use crate::campaign_state::FileCampaignStateStore;
    use std::sync::Mutex;

    struct CountingTaskRunner {
        fail_ids: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskRunner for CountingTaskRunner {
        async fn run_task(&self, bead_id: &str) -> Result<Vec<PhaseResult>, String> {
            self.calls.lock().unwrap().push(bead_id.to_string());
            if self.fail_ids.contains(&bead_id.to_string()) {
                Err("task failed".to_string())
            } else {
                Ok(vec![])
            }
        }
    }

    async fn setup(n: usize) -> (tempfile::TempDir, YamlIssueTracker, String, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = YamlIssueTracker::new(dir.path().join("beads.yaml"));
        let parent = tracker
            .create(CreateBeadInput {
                title: "Epic".to_string(),
                issue_type: IssueType::Epic,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut children = vec![];
        for i in 0..n {
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
        (dir, tracker, parent, children)
    }

    #[tokio::test]
    async fn happy_path_completes_all_tasks_in_order() {
        let (dir, tracker, parent, children) = setup(2).await;
        let state_store = FileCampaignStateStore::new(dir.path().join("campaigns"));
        let runner = CountingTaskRunner { fail_ids: vec![], calls: Mutex::new(vec![]) };
        let cfg = CampaignConfig {
            issue_tracker: &tracker,
            state_store: &state_store,
            task_runner: &runner,
            post_task_hook: None,
            validation_phase: None,
            failure_mode: FailureMode::Abort,
            circuit_breaker: 0,
        };
        let mut visited = HashSet::new();
        let cancel = CancellationToken::new();
        let state = run_campaign(&cfg, &parent, 0, &mut visited, &cancel).await.unwrap();

        assert_eq!(state.status, CampaignStatus::Completed);
        assert_eq!(state.tasks.len(), 2);
        assert!(state.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(*runner.calls.lock().unwrap(), children);
    }

    #[tokio::test]
    async fn circuit_breaker_stops_before_the_third_task() {
        let (dir, tracker, parent, children) = setup(3).await;
        let state_store = FileCampaignStateStore::new(dir.path().join("campaigns"));
        let runner = CountingTaskRunner {
            fail_ids: children.clone(),
            calls: Mutex::new(vec![]),
        };
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
        let cancel = CancellationToken::new();
        let err = run_campaign(&cfg, &parent, 0, &mut visited, &cancel).await.unwrap_err();

        match err {
            CampaignError::CircuitBroken { count, failing_ids } => {
                assert_eq!(count, 2);
                assert_eq!(failing_ids, children[0..2].to_vec());
            }
            other => panic!("expected CircuitBroken, got {other:?}"),
        }
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn no_ready_children_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = YamlIssueTracker::new(dir.path().join("beads.yaml"));
        let parent = tracker
            .create(CreateBeadInput { title: "Empty epic".to_string(), issue_type: IssueType::Epic, ..Default::default() })
            .await
            .unwrap();
        let state_store = FileCampaignStateStore::new(dir.path().join("campaigns"));
        let runner = CountingTaskRunner { fail_ids: vec![], calls: Mutex::new(vec![]) };
        let cfg = CampaignConfig {
            issue_tracker: &tracker,
            state_store: &state_store,
            task_runner: &runner,
            post_task_hook: None,
            validation_phase: None,
            failure_mode: FailureMode::Abort,
            circuit_breaker: 0,
        };
        let mut visited = HashSet::new();
        let cancel = CancellationToken::new();
        assert!(matches!(
            run_campaign(&cfg, &parent, 0, &mut visited, &cancel).await,
            Err(CampaignError::NoTasks(_))
        ));
    }
}
