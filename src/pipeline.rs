use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapters::prompt::{PromptLoader, PromptVars};
use crate::checkpoint::CheckpointStore;
use crate::engine::{execute_phase, Gate, PhaseContext, PipelineError};
use crate::provider_registry::ProviderRegistry;
use crate::retry::{resolve_retry_strategy, RetryDefaults};
use crate::types::{
    PhaseDefinition, PhaseKind, PhaseResult, PhaseStatusMarker, PipelineInput, PipelineOutput,
    StatusUpdate, TransitionStatus,
};
use crate::log_info;

static PAUSE_REQUESTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Process-wide pause flag, set from the CLI's signal handler. Consulted
/// only at phase boundaries, never inside a running provider call.
pub fn pause_flag() -> Arc<AtomicBool> {
    PAUSE_REQUESTED
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

fn pause_requested() -> bool {
    pause_flag().load(Ordering::Relaxed)
}

pub enum PipelineOutcome {
    Completed(PipelineOutput),
    Paused,
}

/// Synchronous observer invoked on every phase-level status transition, in
/// strict FIFO order with the phases as they execute.
pub trait StatusObserver: Send + Sync {
    fn on_update(&self, update: &StatusUpdate);
}

/// Discards every update; used by tests and by the `dashboard`/plain-text
/// CLI surfaces that prefer to poll the event bridge instead.
pub struct NullObserver;

impl StatusObserver for NullObserver {
    fn on_update(&self, _update: &StatusUpdate) {}
}

pub struct PipelineConfig<'a> {
    pub phases: &'a [PhaseDefinition],
    pub registry: &'a ProviderRegistry,
    pub default_provider: &'a str,
    pub retry_defaults: &'a RetryDefaults,
    pub checkpoint_store: Option<&'a dyn CheckpointStore>,
    pub gate: Option<&'a dyn Gate>,
    pub prompt_loader: Option<&'a dyn PromptLoader>,
}

/// Builds the prompt handed to a phase's provider. When `loader` is set and
/// has a template for this phase's name, that template wins (composed with
/// `PromptVars`); otherwise falls back to the fixed layout below, which is
/// also what every phase gets when no template directory is configured.
fn build_prompt(
    phase: &PhaseDefinition,
    input: &PipelineInput,
    feedback: Option<&str>,
    loader: Option<&dyn PromptLoader>,
) -> String {
    if let Some(loader) = loader {
        if let Ok(template) = loader.load(&phase.name) {
            let task = format!("{}\n\n{}\n\n## Acceptance / context\n{}", input.title, input.description, input.bead_context);
            return loader.compose(
                &template,
                &PromptVars {
                    task: &task,
                    feedback,
                    siblings: input.sibling_context.as_deref(),
                    ancestors: None,
                },
            );
        }
    }

    let mut prompt = format!(
        "# {}\n\n{}\n\n## Acceptance / context\n{}\n",
        input.title, input.description, input.bead_context
    );
    if let Some(siblings) = &input.sibling_context {
        prompt.push_str(&format!("\n## Sibling tasks\n{siblings}\n"));
    }
    prompt.push_str(&format!("\n## Phase\n{}\n", phase.name));
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\n## Reviewer feedback from the previous attempt\n{feedback}\n"));
    }
    prompt
}

fn emit(
    observer: &dyn StatusObserver,
    bead_id: &str,
    phase: &str,
    status: TransitionStatus,
    progress: (usize, usize),
    attempt: u32,
    max_retries: u32,
    duration: Duration,
    signal: Option<&crate::types::Signal>,
) {
    observer.on_update(&StatusUpdate {
        bead_id: bead_id.to_string(),
        phase: phase.to_string(),
        status,
        progress: format!("{}/{}", progress.0, progress.1),
        attempt,
        max_retries,
        duration,
        signal: signal.cloned(),
    });
}

fn paired_reviewer_for<'a>(
    phases: &'a [PhaseDefinition],
    worker_idx: usize,
) -> Option<&'a PhaseDefinition> {
    let worker = &phases[worker_idx];
    let next = phases.get(worker_idx + 1)?;
    if next.kind == PhaseKind::Reviewer && next.retry_target.as_deref() == Some(worker.name.as_str()) {
        Some(next)
    } else {
        None
    }
}

/// Find the worker a reviewer's `retry_target` names, wherever it sits in the
/// phase list. A reviewer may target an earlier, non-adjacent worker (spec
/// 4.5: `sign-off` targeting `execute` with `execute-review` in between).
pub(crate) fn worker_by_name<'a>(phases: &'a [PhaseDefinition], name: &str) -> Option<&'a PhaseDefinition> {
    phases.iter().find(|p| p.kind == PhaseKind::Worker && p.name == name)
}

/// Run a worker/reviewer pair (spec 4.5): the reviewer retries up to its
/// resolved budget; NEEDS_WORK feeds back into the worker's next prompt
/// verbatim; the worker itself is never retried on its own NEEDS_WORK
/// (treated as an abort). When `worker` is adjacent to `reviewer` in the
/// phase list, it hasn't run yet and `rerun_worker_first` is `true` so it
/// runs on attempt 1 too. When `reviewer` targets an earlier, non-adjacent
/// worker that has already run once as part of its own pairing, the first
/// attempt reviews that existing result and `worker` is only re-invoked once
/// NEEDS_WORK actually calls for a retry.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_pair(
    cfg: &PipelineConfig<'_>,
    worker: &PhaseDefinition,
    reviewer: &PhaseDefinition,
    input: &PipelineInput,
    work_dir: &Path,
    changed_files: &mut Vec<String>,
    progress: (usize, usize),
    observer: &dyn StatusObserver,
    cancel: &CancellationToken,
    rerun_worker_first: bool,
) -> Result<Vec<PhaseResult>, PipelineError> {
    let strategy = resolve_retry_strategy(reviewer, cfg.retry_defaults);
    let mut results = Vec::new();
    let mut feedback: Option<String> = None;

    for attempt in 1..=strategy.max_attempts {
        if rerun_worker_first || attempt > 1 {
            let worker_prompt = build_prompt(worker, input, feedback.as_deref(), cfg.prompt_loader);
            emit(
                observer,
                &input.bead_id,
                &worker.name,
                TransitionStatus::Running,
                progress,
                attempt,
                strategy.max_attempts,
                Duration::ZERO,
                None,
            );
            let worker_strategy = resolve_retry_strategy(worker, cfg.retry_defaults);
            let worker_result = execute_phase(PhaseContext {
                phase: worker,
                prompt: &worker_prompt,
                work_dir,
                attempt,
                registry: cfg.registry,
                default_provider: cfg.default_provider,
                retry_strategy: &worker_strategy,
                changed_files,
                gate: cfg.gate,
                cancel,
            })
            .await?;

            if worker_result.status != PhaseStatusMarker::Pass && worker_result.status != PhaseStatusMarker::Skip {
                emit(
                    observer,
                    &input.bead_id,
                    &worker.name,
                    TransitionStatus::Failed,
                    progress,
                    attempt,
                    strategy.max_attempts,
                    worker_result.duration,
                    worker_result.signal.as_ref(),
                );
                let message = worker_result
                    .signal
                    .as_ref()
                    .map(|s| s.feedback.clone())
                    .unwrap_or_else(|| "worker did not pass".to_string());
                return Err(PipelineError::new(&worker.name, attempt, message));
            }
            emit(
                observer,
                &input.bead_id,
                &worker.name,
                if worker_result.status == PhaseStatusMarker::Skip {
                    TransitionStatus::Skipped
                } else {
                    TransitionStatus::Passed
                },
                progress,
                attempt,
                strategy.max_attempts,
                worker_result.duration,
                worker_result.signal.as_ref(),
            );
            if let Some(s) = &worker_result.signal {
                changed_files.extend(s.files_changed.iter().cloned());
            }
            results.push(worker_result);
        }

        let reviewer_prompt = build_prompt(reviewer, input, feedback.as_deref(), cfg.prompt_loader);
        emit(
            observer,
            &input.bead_id,
            &reviewer.name,
            TransitionStatus::Running,
            progress,
            attempt,
            strategy.max_attempts,
            Duration::ZERO,
            None,
        );
        let reviewer_result = execute_phase(PhaseContext {
            phase: reviewer,
            prompt: &reviewer_prompt,
            work_dir,
            attempt,
            registry: cfg.registry,
            default_provider: cfg.default_provider,
            retry_strategy: &strategy,
            changed_files,
            gate: cfg.gate,
            cancel,
        })
        .await?;

        match reviewer_result.status {
            PhaseStatusMarker::Pass | PhaseStatusMarker::Skip => {
                emit(
                    observer,
                    &input.bead_id,
                    &reviewer.name,
                    if reviewer_result.status == PhaseStatusMarker::Skip {
                        TransitionStatus::Skipped
                    } else {
                        TransitionStatus::Passed
                    },
                    progress,
                    attempt,
                    strategy.max_attempts,
                    reviewer_result.duration,
                    reviewer_result.signal.as_ref(),
                );
                results.push(reviewer_result);
                return Ok(results);
            }
            PhaseStatusMarker::NeedsWork => {
                let fb = reviewer_result
                    .signal
                    .as_ref()
                    .map(|s| s.feedback.clone())
                    .unwrap_or_default();
                emit(
                    observer,
                    &input.bead_id,
                    &reviewer.name,
                    TransitionStatus::Failed,
                    progress,
                    attempt,
                    strategy.max_attempts,
                    reviewer_result.duration,
                    reviewer_result.signal.as_ref(),
                );
                results.push(reviewer_result);
                if attempt == strategy.max_attempts {
                    return Err(PipelineError::new(&reviewer.name, attempt, fb));
                }
                feedback = Some(fb);
            }
            PhaseStatusMarker::Error => unreachable!("execute_phase turns ERROR into Err"),
        }
    }

    unreachable!("loop always returns before exhausting max_attempts + 1")
}

/// Run a phase with no adjacent pairing partner. Workers with no paired
/// reviewer get exactly one attempt (any non-PASS is fatal); standalone
/// reviewers retry on their own NEEDS_WORK up to their resolved max_attempts.
async fn run_standalone(
    cfg: &PipelineConfig<'_>,
    phase: &PhaseDefinition,
    input: &PipelineInput,
    work_dir: &Path,
    changed_files: &mut Vec<String>,
    progress: (usize, usize),
    observer: &dyn StatusObserver,
    cancel: &CancellationToken,
) -> Result<Vec<PhaseResult>, PipelineError> {
    let mut strategy = resolve_retry_strategy(phase, cfg.retry_defaults);
    if phase.kind == PhaseKind::Worker {
        strategy.max_attempts = 1;
    }

    let mut results = Vec::new();
    let mut feedback: Option<String> = None;

    for attempt in 1..=strategy.max_attempts {
        let prompt = build_prompt(phase, input, feedback.as_deref(), cfg.prompt_loader);
        emit(
            observer,
            &input.bead_id,
            &phase.name,
            TransitionStatus::Running,
            progress,
            attempt,
            strategy.max_attempts,
            Duration::ZERO,
            None,
        );
        let result = execute_phase(PhaseContext {
            phase,
            prompt: &prompt,
            work_dir,
            attempt,
            registry: cfg.registry,
            default_provider: cfg.default_provider,
            retry_strategy: &strategy,
            changed_files,
            gate: cfg.gate,
            cancel,
        })
        .await?;

        match result.status {
            PhaseStatusMarker::Pass | PhaseStatusMarker::Skip => {
                emit(
                    observer,
                    &input.bead_id,
                    &phase.name,
                    if result.status == PhaseStatusMarker::Skip {
                        TransitionStatus::Skipped
                    } else {
                        TransitionStatus::Passed
                    },
                    progress,
                    attempt,
                    strategy.max_attempts,
                    result.duration,
                    result.signal.as_ref(),
                );
                if let Some(s) = &result.signal {
                    changed_files.extend(s.files_changed.iter().cloned());
                }
                results.push(result);
                return Ok(results);
            }
            PhaseStatusMarker::NeedsWork => {
                let fb = result
                    .signal
                    .as_ref()
                    .map(|s| s.feedback.clone())
                    .unwrap_or_default();
                emit(
                    observer,
                    &input.bead_id,
                    &phase.name,
                    TransitionStatus::Failed,
                    progress,
                    attempt,
                    strategy.max_attempts,
                    result.duration,
                    result.signal.as_ref(),
                );
                results.push(result);
                if attempt == strategy.max_attempts {
                    return Err(PipelineError::new(&phase.name, attempt, fb));
                }
                feedback = Some(fb);
            }
            PhaseStatusMarker::Error => unreachable!("execute_phase turns ERROR into Err"),
        }
    }

    unreachable!("loop always returns before exhausting max_attempts + 1")
}

/// Top-level pipeline run (spec 4.6). Loads a checkpoint if a store is
/// configured, derives the skip-set, walks phases in definition order,
/// pairing adjacent worker/reviewer phases and running everything else
/// standalone, saving a checkpoint after every phase boundary.
pub async fn run_pipeline(
    cfg: &PipelineConfig<'_>,
    input: &PipelineInput,
    work_dir: &Path,
    observer: &dyn StatusObserver,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, PipelineError> {
    let mut phase_results: Vec<PhaseResult> = Vec::new();
    let mut skip_set: HashSet<String> = input.skip_phases.clone();
    let mut changed_files: Vec<String> = Vec::new();

    if let Some(store) = cfg.checkpoint_store {
        if let Ok(Some(checkpoint)) = store.load(&input.bead_id) {
            for r in &checkpoint.phase_results {
                if matches!(r.status, PhaseStatusMarker::Pass | PhaseStatusMarker::Skip) {
                    skip_set.insert(r.phase.clone());
                }
                if let Some(s) = &r.signal {
                    changed_files.extend(s.files_changed.iter().cloned());
                }
            }
            phase_results = checkpoint.phase_results;
            log_info!(
                "[pipeline] resumed bead `{}` from checkpoint with {} prior results",
                input.bead_id,
                phase_results.len()
            );
        }
    }

    let total = cfg.phases.len();
    let mut idx = 0;
    while idx < total {
        let phase_def = &cfg.phases[idx];

        if skip_set.contains(&phase_def.name) {
            if !phase_results.iter().any(|r| r.phase == phase_def.name) {
                phase_results.push(PhaseResult {
                    phase: phase_def.name.clone(),
                    attempt: 0,
                    signal: None,
                    status: PhaseStatusMarker::Skip,
                    duration: Duration::ZERO,
                    timestamp: chrono::Utc::now(),
                });
                emit(
                    observer,
                    &input.bead_id,
                    &phase_def.name,
                    TransitionStatus::Skipped,
                    (idx + 1, total),
                    0,
                    0,
                    Duration::ZERO,
                    None,
                );
            }
            idx += 1;
            continue;
        }

        if pause_requested() {
            if let Some(store) = cfg.checkpoint_store {
                store
                    .save(&input.bead_id, &phase_results)
                    .map_err(|e| PipelineError::new(&phase_def.name, 0, e.to_string()))?;
            }
            return Ok(PipelineOutcome::Paused);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::new(&phase_def.name, 0, "run cancelled"));
        }

        let mut step_results = if phase_def.kind == PhaseKind::Worker {
            if let Some(reviewer) = paired_reviewer_for(cfg.phases, idx) {
                let r = run_pair(
                    cfg,
                    phase_def,
                    reviewer,
                    input,
                    work_dir,
                    &mut changed_files,
                    (idx + 1, total),
                    observer,
                    cancel,
                    true,
                )
                .await?;
                idx += 1; // the paired reviewer is consumed alongside the worker
                r
            } else {
                run_standalone(
                    cfg,
                    phase_def,
                    input,
                    work_dir,
                    &mut changed_files,
                    (idx + 1, total),
                    observer,
                    cancel,
                )
                .await?
            }
        } else if let Some(target) = phase_def
            .retry_target
            .as_deref()
            .and_then(|name| worker_by_name(cfg.phases, name))
        {
            run_pair(
                cfg,
                target,
                phase_def,
                input,
                work_dir,
                &mut changed_files,
                (idx + 1, total),
                observer,
                cancel,
                false,
            )
            .await?
        } else {
            run_standalone(
                cfg,
                phase_def,
                input,
                work_dir,
                &mut changed_files,
                (idx + 1, total),
                observer,
                cancel,
            )
            .await?
        };

        phase_results.append(&mut step_results);
        idx += 1;

        if let Some(store) = cfg.checkpoint_store {
            store
                .save(&input.bead_id, &phase_results)
                .map_err(|e| PipelineError::new(&phase_def.name, 0, e.to_string()))?;
        }
    }

    Ok(PipelineOutcome::Completed(PipelineOutput {
        completed: true,
        phase_results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseKind;

    fn worker(name: &str) -> PhaseDefinition {
        PhaseDefinition {
            name: name.to_string(),
            kind: PhaseKind::Worker,
            retry_target: None,
            condition: None,
            provider: None,
            timeout_secs: 0,
            max_retries: 0,
            gate: None,
        }
    }

    fn reviewer(name: &str, target: &str) -> PhaseDefinition {
        PhaseDefinition {
            name: name.to_string(),
            kind: PhaseKind::Reviewer,
            retry_target: Some(target.to_string()),
            condition: None,
            provider: None,
            timeout_secs: 0,
            max_retries: 0,
            gate: None,
        }
    }

    #[test]
    fn paired_reviewer_detects_adjacent_pair() {
        let phases = vec![worker("implement"), reviewer("review", "implement")];
        assert!(paired_reviewer_for(&phases, 0).is_some());
    }

    #[test]
    fn paired_reviewer_is_none_for_non_adjacent_target() {
        let phases = vec![
            worker("implement"),
            worker("document"),
            reviewer("review", "implement"),
        ];
        assert!(paired_reviewer_for(&phases, 0).is_none());
    }

    #[test]
    fn worker_by_name_finds_a_non_adjacent_worker() {
        let phases = vec![
            worker("execute"),
            reviewer("execute-review", "execute"),
            reviewer("sign-off", "execute"),
        ];
        let found = worker_by_name(&phases, "execute").expect("execute should be found");
        assert_eq!(found.name, "execute");
    }

    #[test]
    fn worker_by_name_is_none_for_an_unknown_target() {
        let phases = vec![worker("execute"), reviewer("sign-off", "nonexistent")];
        assert!(worker_by_name(&phases, "nonexistent").is_none());
    }

    #[test]
    fn build_prompt_includes_feedback_when_present() {
        let input = PipelineInput {
            bead_id: "b-1".to_string(),
            title: "Title".to_string(),
            description: "Desc".to_string(),
            bead_context: "ctx".to_string(),
            sibling_context: None,
            skip_phases: HashSet::new(),
        };
        let phase = worker("implement");
        let prompt = build_prompt(&phase, &input, Some("fix the thing"), None);
        assert!(prompt.contains("fix the thing"));
    }

    struct StubLoader;

    impl PromptLoader for StubLoader {
        fn load(&self, name: &str) -> Result<String, crate::adapters::prompt::PromptError> {
            if name == "implement" {
                Ok("custom template: {{task}}".to_string())
            } else {
                Err(crate::adapters::prompt::PromptError::NotFound(name.to_string()))
            }
        }

        fn compose(&self, template: &str, vars: &PromptVars<'_>) -> String {
            template.replace("{{task}}", vars.task)
        }
    }

    #[test]
    fn build_prompt_prefers_a_configured_template_over_the_built_in_layout() {
        let input = PipelineInput {
            bead_id: "b-1".to_string(),
            title: "Title".to_string(),
            description: "Desc".to_string(),
            bead_context: "ctx".to_string(),
            sibling_context: None,
            skip_phases: HashSet::new(),
        };
        let phase = worker("implement");
        let loader = StubLoader;
        let prompt = build_prompt(&phase, &input, None, Some(&loader));
        assert!(prompt.starts_with("custom template: Title"));
    }

    #[test]
    fn build_prompt_falls_back_when_the_loader_has_no_template_for_the_phase() {
        let input = PipelineInput {
            bead_id: "b-1".to_string(),
            title: "Title".to_string(),
            description: "Desc".to_string(),
            bead_context: "ctx".to_string(),
            sibling_context: None,
            skip_phases: HashSet::new(),
        };
        let phase = worker("review");
        let loader = StubLoader;
        let prompt = build_prompt(&phase, &input, None, Some(&loader));
        assert!(prompt.starts_with("# Title"));
    }
}
