mod common;

use capsule::adapters::worktree::{GitWorktree, Worktree};
use capsule::preflight::{run_preflight, PreflightError};
use capsule::provider_registry::ProviderRegistry;
use capsule::types::{PhaseDefinition, PhaseKind};

fn phase(name: &str) -> PhaseDefinition {
    PhaseDefinition {
        name: name.to_string(),
        kind: PhaseKind::Worker,
        retry_target: None,
        condition: None,
        provider: None,
        timeout_secs: 60,
        max_retries: 3,
        gate: None,
    }
}

/// Mirrors the gating order `run`/`campaign` follow in the CLI entry point:
/// preflight runs before any worktree I/O, so a config naming an unknown
/// provider never gets as far as creating a worktree.
async fn attempt_run(
    phases: &[PhaseDefinition],
    registry: &ProviderRegistry,
    default_provider: &str,
    worktree: &GitWorktree,
    bead_id: &str,
) -> Result<(), Vec<PreflightError>> {
    let errors = run_preflight(phases, registry, default_provider);
    if !errors.is_empty() {
        return Err(errors);
    }
    worktree.create(bead_id).await.expect("worktree create should succeed");
    Ok(())
}

/// Scenario 6: a config naming a provider the registry doesn't know about.
/// Preflight must report it and nothing past preflight — in particular no
/// worktree — should ever run.
#[tokio::test]
async fn unknown_provider_fails_preflight_before_any_worktree_io() {
    let repo_dir = tempfile::tempdir().unwrap();
    common::init_repo(repo_dir.path());
    let worktrees_dir = repo_dir.path().join(".capsule/worktrees");
    let worktree = GitWorktree::new(repo_dir.path(), &worktrees_dir);

    let phases = vec![phase("implement")];
    let registry = ProviderRegistry::with_builtins();

    let result = attempt_run(&phases, &registry, "ghost-provider", &worktree, "demo-1").await;

    let errors = result.expect_err("expected preflight to reject the unknown provider");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].condition.contains("ghost-provider"));
    assert_eq!(errors[0].config_location, "runtime.provider");

    assert!(!worktree.exists("demo-1").await.unwrap());
    assert!(!worktrees_dir.exists());
}
