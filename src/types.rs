use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Bead ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    #[default]
    Task,
    Feature,
    Epic,
    Bug,
}

impl IssueType {
    /// Campaigns recurse into features and epics; tasks and bugs run a pipeline directly.
    pub fn is_composite(&self) -> bool {
        matches!(self, IssueType::Feature | IssueType::Epic)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub issue_type: IssueType,
    pub status: BeadStatus,
    /// 0 = highest priority.
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Bead {
    /// `X.1.1` is a child of `X.1` is a child of `X`.
    pub fn parent_id_from_hierarchy(id: &str) -> Option<String> {
        let (parent, _) = id.rsplit_once('.')?;
        Some(parent.to_string())
    }
}

// --- Phase definition ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Worker,
    Reviewer,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseDefinition {
    pub name: String,
    pub kind: PhaseKind,
    /// Name of the worker this reviewer retries on NEEDS_WORK. Only meaningful for reviewers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_target: Option<String>,
    /// Currently only `files_match:<glob>` is recognised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Seconds; 0 means no deadline beyond the ambient context.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// An external post-check (e.g. compile/test) that can coerce PASS into NEEDS_WORK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
}

impl PhaseDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// --- Signal ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pass,
    NeedsWork,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Signal {
    pub status: SignalStatus,
    pub feedback: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

// --- Phase result ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatusMarker {
    Pass,
    Skip,
    NeedsWork,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseResult {
    pub phase: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    pub status: PhaseStatusMarker,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

// --- Pipeline input/output ---

#[derive(Clone, Debug, Default)]
pub struct PipelineInput {
    pub bead_id: String,
    pub title: String,
    pub description: String,
    /// Epic/feature ancestry text rendered into the prompt.
    pub bead_context: String,
    /// Adjacent task summaries from a campaign parent.
    pub sibling_context: Option<String>,
    pub skip_phases: HashSet<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PipelineOutput {
    pub completed: bool,
    pub phase_results: Vec<PhaseResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelineCheckpoint {
    pub bead_id: String,
    pub phase_results: Vec<PhaseResult>,
    pub saved_at: DateTime<Utc>,
}

// --- Status update ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub bead_id: String,
    pub phase: String,
    pub status: TransitionStatus,
    /// e.g. "3/6".
    pub progress: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
}

// --- Campaign state ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub bead_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub phase_results: Vec<PhaseResult>,
    pub duration: Duration,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CampaignState {
    pub campaign_id: String,
    pub parent_id: String,
    pub tasks: Vec<TaskResult>,
    pub current_task_idx: usize,
    pub consec_failures: u32,
    pub status: CampaignStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    Abort,
    Continue,
    PauseOnFail,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::Abort
    }
}
