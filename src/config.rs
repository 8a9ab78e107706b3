use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryDefaults;
use crate::types::{FailureMode, PhaseDefinition, PhaseKind};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
struct RuntimeFileConfig {
    provider: Option<String>,
    timeout: Option<u64>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
struct WorktreeFileConfig {
    base_dir: Option<String>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
struct PipelineFileConfig {
    phases: Option<Vec<PhaseDefinition>>,
    checkpoint: Option<bool>,
    backoff_factor: Option<f64>,
    escalate_provider: Option<String>,
    escalate_after: Option<u32>,
    templates_dir: Option<String>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
struct CampaignFileConfig {
    failure_mode: Option<FailureMode>,
    circuit_breaker: Option<u32>,
    discovery_filing: Option<bool>,
    validation_phases: Option<Vec<String>>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
struct FileConfig {
    runtime: RuntimeFileConfig,
    worktree: WorktreeFileConfig,
    pipeline: PipelineFileConfig,
    campaign: CampaignFileConfig,
}

impl FileConfig {
    /// Merge `layer` over `self`; any field `layer` sets wins.
    fn overlay(self, layer: FileConfig) -> FileConfig {
        FileConfig {
            runtime: RuntimeFileConfig {
                provider: layer.runtime.provider.or(self.runtime.provider),
                timeout: layer.runtime.timeout.or(self.runtime.timeout),
            },
            worktree: WorktreeFileConfig {
                base_dir: layer.worktree.base_dir.or(self.worktree.base_dir),
            },
            pipeline: PipelineFileConfig {
                phases: layer.pipeline.phases.or(self.pipeline.phases),
                checkpoint: layer.pipeline.checkpoint.or(self.pipeline.checkpoint),
                backoff_factor: layer.pipeline.backoff_factor.or(self.pipeline.backoff_factor),
                escalate_provider: layer.pipeline.escalate_provider.or(self.pipeline.escalate_provider),
                escalate_after: layer.pipeline.escalate_after.or(self.pipeline.escalate_after),
                templates_dir: layer.pipeline.templates_dir.or(self.pipeline.templates_dir),
            },
            campaign: CampaignFileConfig {
                failure_mode: layer.campaign.failure_mode.or(self.campaign.failure_mode),
                circuit_breaker: layer.campaign.circuit_breaker.or(self.campaign.circuit_breaker),
                discovery_filing: layer.campaign.discovery_filing.or(self.campaign.discovery_filing),
                validation_phases: layer.campaign.validation_phases.or(self.campaign.validation_phases),
            },
        }
    }
}

fn default_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition {
            name: "implement".to_string(),
            kind: PhaseKind::Worker,
            retry_target: None,
            condition: None,
            provider: None,
            timeout_secs: 300,
            max_retries: 0,
            gate: None,
        },
        PhaseDefinition {
            name: "review".to_string(),
            kind: PhaseKind::Reviewer,
            retry_target: Some("implement".to_string()),
            condition: None,
            provider: None,
            timeout_secs: 300,
            max_retries: 3,
            gate: None,
        },
    ]
}

fn builtin_defaults() -> FileConfig {
    FileConfig {
        runtime: RuntimeFileConfig {
            provider: Some("claude".to_string()),
            timeout: Some(300),
        },
        worktree: WorktreeFileConfig {
            base_dir: Some(".capsule".to_string()),
        },
        pipeline: PipelineFileConfig {
            phases: Some(default_phases()),
            checkpoint: Some(true),
            backoff_factor: Some(1.0),
            escalate_provider: None,
            escalate_after: None,
            templates_dir: None,
        },
        campaign: CampaignFileConfig {
            failure_mode: Some(FailureMode::Abort),
            circuit_breaker: Some(3),
            discovery_filing: Some(false),
            validation_phases: Some(vec![]),
        },
    }
}

/// The fully assembled, validated configuration every component consumes.
/// Every field here is resolved — no more `Option` distinguishing
/// unset-from-zero past this point.
#[derive(Clone, Debug)]
pub struct Config {
    pub provider: String,
    pub timeout: Duration,
    pub worktree_base_dir: PathBuf,
    pub phases: Vec<PhaseDefinition>,
    pub checkpoint_enabled: bool,
    pub retry_defaults: RetryDefaults,
    pub failure_mode: FailureMode,
    pub circuit_breaker: u32,
    pub discovery_filing: bool,
    pub validation_phases: Vec<String>,
    pub prompt_templates_dir: Option<PathBuf>,
}

/// CLI flags that may override anything below them in the layering order.
#[derive(Default, Clone, Debug)]
pub struct CliOverrides {
    pub provider: Option<String>,
    pub timeout: Option<u64>,
}

fn read_file_layer(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_yaml_ng::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn env_layer() -> FileConfig {
    let mut layer = FileConfig::default();
    if let Ok(provider) = std::env::var("CAPSULE_PROVIDER") {
        layer.runtime.provider = Some(provider);
    }
    if let Ok(timeout) = std::env::var("CAPSULE_TIMEOUT") {
        if let Ok(secs) = timeout.parse() {
            layer.runtime.timeout = Some(secs);
        }
    }
    layer
}

fn cli_layer(overrides: &CliOverrides) -> FileConfig {
    FileConfig {
        runtime: RuntimeFileConfig {
            provider: overrides.provider.clone(),
            timeout: overrides.timeout,
        },
        ..FileConfig::default()
    }
}

/// Assemble the five layers from spec: built-in defaults, user config,
/// project config, `CAPSULE_*` env vars, CLI flags — later layers override
/// only the fields they actually set.
pub fn load_config(
    user_config_path: &Path,
    project_config_path: &Path,
    cli_overrides: &CliOverrides,
) -> Result<Config, ConfigError> {
    let merged = builtin_defaults()
        .overlay(read_file_layer(user_config_path)?)
        .overlay(read_file_layer(project_config_path)?)
        .overlay(env_layer())
        .overlay(cli_layer(cli_overrides));

    assemble(merged)
}

fn assemble(merged: FileConfig) -> Result<Config, ConfigError> {
    let mut errors = Vec::new();

    let provider = merged.runtime.provider.unwrap_or_default();
    if provider.is_empty() {
        errors.push("runtime.provider must be non-empty".to_string());
    }

    let timeout_secs = merged.runtime.timeout.unwrap_or(0);
    if timeout_secs == 0 {
        errors.push("runtime.timeout must be positive".to_string());
    }

    let worktree_base_dir = merged.worktree.base_dir.unwrap_or_default();
    if worktree_base_dir.is_empty() {
        errors.push("worktree.base_dir must be non-empty".to_string());
    }

    let phases = merged.pipeline.phases.unwrap_or_default();
    if phases.is_empty() {
        errors.push("pipeline.phases must not be empty".to_string());
    }
    for condition_error in crate::phase::validate_phase_definitions(&phases) {
        errors.push(condition_error);
    }

    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors));
    }

    Ok(Config {
        provider,
        timeout: Duration::from_secs(timeout_secs),
        worktree_base_dir: PathBuf::from(worktree_base_dir),
        phases,
        checkpoint_enabled: merged.pipeline.checkpoint.unwrap_or(true),
        retry_defaults: RetryDefaults {
            max_retries: 3,
            backoff_factor: merged.pipeline.backoff_factor.unwrap_or(1.0),
            escalate_provider: merged.pipeline.escalate_provider,
            escalate_after: merged.pipeline.escalate_after,
        },
        failure_mode: merged.campaign.failure_mode.unwrap_or(FailureMode::Abort),
        circuit_breaker: merged.campaign.circuit_breaker.unwrap_or(0),
        discovery_filing: merged.campaign.discovery_filing.unwrap_or(false),
        validation_phases: merged.campaign.validation_phases.unwrap_or_default(),
        prompt_templates_dir: merged.pipeline.templates_dir.map(PathBuf::from),
    })
}
