use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::phase::{evaluate_condition, ConditionError};
use crate::provider::ProviderError;
use crate::provider_registry::{ProviderRegistry, UnknownProviderError};
use crate::retry::RetryStrategy;
use crate::signal::SignalParseError;
use crate::types::{PhaseDefinition, PhaseResult, PhaseStatusMarker, Signal, SignalStatus};
use crate::{log_info, log_warn};

/// A phase-level failure, carrying enough structure for the CLI to map to an
/// exit code without string-matching the message.
#[derive(Error, Debug, Clone)]
#[error("phase `{phase}` failed on attempt {attempt}: {message}")]
pub struct PipelineError {
    pub phase: String,
    pub attempt: u32,
    pub message: String,
}

impl PipelineError {
    pub fn new(phase: &str, attempt: u32, message: impl Into<String>) -> Self {
        PipelineError {
            phase: phase.to_string(),
            attempt,
            message: message.into(),
        }
    }
}

impl From<UnknownProviderError> for PipelineError {
    fn from(e: UnknownProviderError) -> Self {
        PipelineError::new("<condition>", 0, e.to_string())
    }
}

/// A gate runs an external post-check (typically compile/test) after a PASS
/// signal; a non-zero result coerces the signal to NEEDS_WORK so reviewers
/// never rubber-stamp work that doesn't actually build.
#[async_trait::async_trait]
pub trait Gate: Send + Sync {
    async fn check(&self, spec: &str, work_dir: &Path) -> Result<(), String>;
}

/// Runs the gate string as a shell command in the bead's worktree; failure
/// message is the command's combined stdout+stderr tail.
pub struct ShellGate;

#[async_trait::async_trait]
impl Gate for ShellGate {
    async fn check(&self, spec: &str, work_dir: &Path) -> Result<(), String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(spec)
            .current_dir(work_dir)
            .output()
            .await
            .map_err(|e| format!("gate command failed to spawn: {e}"))?;
        if output.status.success() {
            return Ok(());
        }
        let mut diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
        if diagnostic.trim().is_empty() {
            diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        Err(diagnostic)
    }
}

/// Everything `execute_phase` needs to run one phase attempt, gathered so the
/// call site stays readable.
pub struct PhaseContext<'a> {
    pub phase: &'a PhaseDefinition,
    pub prompt: &'a str,
    pub work_dir: &'a Path,
    pub attempt: u32,
    pub registry: &'a ProviderRegistry,
    pub default_provider: &'a str,
    pub retry_strategy: &'a RetryStrategy,
    pub changed_files: &'a [String],
    pub gate: Option<&'a dyn Gate>,
    pub cancel: &'a CancellationToken,
}

/// Execute exactly one attempt of one phase: evaluate its condition, pick a
/// provider (honoring retry escalation), invoke it, parse the signal, run
/// the gate if any. Does not retry — that's `pipeline.rs`'s job.
pub async fn execute_phase(ctx: PhaseContext<'_>) -> Result<PhaseResult, PipelineError> {
    let condition_matches = evaluate_condition(ctx.phase.condition.as_deref(), ctx.changed_files)
        .map_err(|e: ConditionError| {
            PipelineError::new(&ctx.phase.name, ctx.attempt, e.to_string())
        })?;

    if !condition_matches {
        log_info!(
            "[engine] phase `{}` skipped: condition not met",
            ctx.phase.name
        );
        return Ok(PhaseResult {
            phase: ctx.phase.name.clone(),
            attempt: ctx.attempt,
            signal: None,
            status: PhaseStatusMarker::Skip,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        });
    }

    let provider_name = ctx
        .retry_strategy
        .provider_for_attempt(ctx.attempt)
        .or(ctx.phase.provider.as_deref())
        .unwrap_or(ctx.default_provider);
    let provider = ctx
        .registry
        .get(provider_name)
        .map_err(|e| PipelineError::new(&ctx.phase.name, ctx.attempt, e.to_string()))?;

    let timeout = ctx.retry_strategy.effective_timeout(ctx.attempt);
    let started = Instant::now();
    let output = provider
        .execute(ctx.prompt, ctx.work_dir, timeout, ctx.cancel)
        .await
        .map_err(|e: ProviderError| {
            PipelineError::new(&ctx.phase.name, ctx.attempt, e.to_string())
        })?;

    let mut signal = output
        .parse_signal()
        .map_err(|e: SignalParseError| {
            PipelineError::new(&ctx.phase.name, ctx.attempt, e.to_string())
        })?;

    if signal.status == SignalStatus::Pass {
        if let Some(gate) = ctx.gate {
            if let Some(gate_spec) = &ctx.phase.gate {
                if let Err(diagnostic) = gate.check(gate_spec, ctx.work_dir).await {
                    log_warn!(
                        "[engine] phase `{}` gate failed, coercing PASS to NEEDS_WORK",
                        ctx.phase.name
                    );
                    signal = Signal {
                        status: SignalStatus::NeedsWork,
                        feedback: diagnostic,
                        files_changed: signal.files_changed,
                        summary: signal.summary,
                        commit_hash: signal.commit_hash,
                    };
                }
            }
        }
    }

    let status = match signal.status {
        SignalStatus::Pass => PhaseStatusMarker::Pass,
        SignalStatus::NeedsWork => PhaseStatusMarker::NeedsWork,
        SignalStatus::Error => PhaseStatusMarker::Error,
    };

    if status == PhaseStatusMarker::Error {
        return Err(PipelineError::new(
            &ctx.phase.name,
            ctx.attempt,
            signal.feedback,
        ));
    }

    Ok(PhaseResult {
        phase: ctx.phase.name.clone(),
        attempt: ctx.attempt,
        signal: Some(signal),
        status,
        duration: started.elapsed(),
        timestamp: Utc::now(),
    })
}
