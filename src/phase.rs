use thiserror::Error;

use crate::types::PhaseDefinition;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unrecognised phase condition `{0}`; expected `files_match:<glob>`")]
    Unrecognised(String),
    #[error("invalid glob pattern in condition `{0}`: {1}")]
    BadPattern(String, String),
}

/// Evaluate a phase's `condition` string (currently only `files_match:<glob>`
/// is recognised) against the set of files changed so far in the bead's
/// worktree. `None` condition always matches. Glob matching is single-level
/// only (`**` is not supported, matching the `glob` crate's `Pattern`
/// semantics used literally).
pub fn evaluate_condition(
    condition: Option<&str>,
    changed_files: &[String],
) -> Result<bool, ConditionError> {
    let Some(condition) = condition else {
        return Ok(true);
    };

    let Some(pattern) = condition.strip_prefix("files_match:") else {
        return Err(ConditionError::Unrecognised(condition.to_string()));
    };

    let compiled = glob::Pattern::new(pattern)
        .map_err(|e| ConditionError::BadPattern(pattern.to_string(), e.to_string()))?;

    Ok(changed_files.iter().any(|f| compiled.matches(f)))
}

/// Structural validation of a phase definition list, independent of any
/// runtime execution. Used by preflight before the pipeline touches a
/// provider or the filesystem.
pub fn validate_phase_definitions(phases: &[PhaseDefinition]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, phase) in phases.iter().enumerate() {
        if !seen.insert(phase.name.clone()) {
            errors.push(format!("duplicate phase name `{}`", phase.name));
        }
        if let Some(target) = &phase.retry_target {
            match phases.iter().position(|p| &p.name == target) {
                Some(target_idx) if target_idx < idx => {}
                Some(_) => errors.push(format!(
                    "phase `{}` retry_target `{}` must name an earlier phase",
                    phase.name, target
                )),
                None => errors.push(format!(
                    "phase `{}` retry_target `{}` does not match any phase",
                    phase.name, target
                )),
            }
        }
        if let Some(condition) = &phase.condition {
            if evaluate_condition(Some(condition), &[]).is_err() {
                errors.push(format!(
                    "phase `{}` has an invalid condition `{}`",
                    phase.name, condition
                ));
            }
        }
    }

    errors
}
