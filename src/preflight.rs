use std::fmt;

use crate::phase::validate_phase_definitions;
use crate::provider_registry::ProviderRegistry;
use crate::types::PhaseDefinition;

/// A single structural violation found before any provider/git I/O happens.
/// Always a setup error (exit 2), never a `PipelineError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightError {
    pub condition: String,
    pub config_location: String,
    pub suggested_fix: String,
}

impl fmt::Display for PreflightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (at {}) — {}",
            self.condition, self.config_location, self.suggested_fix
        )
    }
}

impl std::error::Error for PreflightError {}

/// Validate a pipeline definition's structural invariants and surface every
/// violation at once rather than failing on the first one, so a user fixing
/// their config doesn't have to run this repeatedly to discover each error.
pub fn run_preflight(
    phases: &[PhaseDefinition],
    registry: &ProviderRegistry,
    default_provider: &str,
) -> Vec<PreflightError> {
    let mut errors = Vec::new();

    for condition in validate_phase_definitions(phases) {
        errors.push(PreflightError {
            condition,
            config_location: "pipeline.phases".to_string(),
            suggested_fix: "correct the phase referenced above".to_string(),
        });
    }

    if registry.get(default_provider).is_err() {
        errors.push(PreflightError {
            condition: format!("unknown default provider `{default_provider}`"),
            config_location: "runtime.provider".to_string(),
            suggested_fix: format!("use one of: {}", registry.available_names().join(", ")),
        });
    }

    for phase in phases {
        if let Some(name) = &phase.provider {
            if registry.get(name).is_err() {
                errors.push(PreflightError {
                    condition: format!("phase `{}` references unknown provider `{name}`", phase.name),
                    config_location: format!("pipeline.phases[{}].provider", phase.name),
                    suggested_fix: format!("use one of: {}", registry.available_names().join(", ")),
                });
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseKind;

    fn phase(name: &str, provider: Option<&str>) -> PhaseDefinition {
        PhaseDefinition {
            name: name.to_string(),
            kind: PhaseKind::Worker,
            retry_target: None,
            condition: None,
            provider: provider.map(str::to_string),
            timeout_secs: 0,
            max_retries: 0,
            gate: None,
        }
    }

    #[test]
    fn valid_pipeline_and_provider_has_no_errors() {
        let registry = ProviderRegistry::with_builtins();
        let phases = vec![phase("implement", None)];
        assert!(run_preflight(&phases, &registry, "claude").is_empty());
    }

    #[test]
    fn unknown_default_provider_is_reported() {
        let registry = ProviderRegistry::with_builtins();
        let phases = vec![phase("implement", None)];
        let errors = run_preflight(&phases, &registry, "nonexistent");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].config_location, "runtime.provider");
    }

    #[test]
    fn unknown_phase_provider_override_is_reported() {
        let registry = ProviderRegistry::with_builtins();
        let phases = vec![phase("implement", Some("bogus"))];
        let errors = run_preflight(&phases, &registry, "claude");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].condition.contains("bogus"));
    }

    #[test]
    fn collects_multiple_violations_at_once() {
        let registry = ProviderRegistry::with_builtins();
        let phases = vec![phase("implement", Some("bogus")), phase("implement", None)];
        let errors = run_preflight(&phases, &registry, "also-bogus");
        // duplicate name + bad phase provider + bad default provider
        assert_eq!(errors.len(), 3);
    }
}
