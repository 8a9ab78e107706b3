use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::adapters::worktree::Worktree;
use crate::hooks::ConflictResolver;
use crate::pipeline::{run_pair, worker_by_name, NullObserver, PipelineConfig};
use crate::provider_registry::ProviderRegistry;
use crate::retry::RetryDefaults;
use crate::types::{PhaseDefinition, PhaseKind, PipelineInput};

/// Reference `ConflictResolver` (spec 4.11 step 2): re-runs the configured
/// `execute` -> `sign-off` worker/reviewer pair inside the conflicted
/// worktree, with the conflicting paths injected as reviewer feedback.
pub struct PipelinePairResolver<'a> {
    pub worktree: &'a dyn Worktree,
    pub phases: &'a [PhaseDefinition],
    pub registry: &'a ProviderRegistry,
    pub default_provider: &'a str,
    pub retry_defaults: &'a RetryDefaults,
}

#[async_trait]
impl<'a> ConflictResolver for PipelinePairResolver<'a> {
    async fn resolve(&self, bead_id: &str, conflicted_files: &[String]) -> Result<(), String> {
        let worker = worker_by_name(self.phases, "execute")
            .ok_or_else(|| "no `execute` phase configured for conflict resolution".to_string())?;
        let reviewer = self
            .phases
            .iter()
            .find(|p| p.kind == PhaseKind::Reviewer && p.name == "sign-off")
            .ok_or_else(|| "no `sign-off` phase configured for conflict resolution".to_string())?;

        let work_dir = self.worktree.path_for(bead_id);
        let conflict_note = format!(
            "Merging `{bead_id}` produced conflicts in: {}. Resolve them in the worktree \
             at {} and make sure the tests still pass.",
            conflicted_files.join(", "),
            work_dir.display(),
        );
        let input = PipelineInput {
            bead_id: bead_id.to_string(),
            title: "Resolve merge conflict".to_string(),
            description: conflict_note.clone(),
            bead_context: conflict_note,
            sibling_context: None,
            skip_phases: HashSet::new(),
        };

        let cfg = PipelineConfig {
            phases: &[],
            registry: self.registry,
            default_provider: self.default_provider,
            retry_defaults: self.retry_defaults,
            checkpoint_store: None,
            gate: None,
            prompt_loader: None,
        };
        let cancel = CancellationToken::new();

        run_pair(
            &cfg,
            worker,
            reviewer,
            &input,
            &work_dir,
            &mut Vec::new(),
            (1, 1),
            &NullObserver,
            &cancel,
            true,
        )
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }
}
