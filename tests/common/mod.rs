#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use capsule::provider::CommandConfig;
use capsule::provider_registry::ProviderRegistry;
use capsule::types::{PhaseDefinition, PhaseKind};

/// Absolute path to the fake-agent script every scenario test points
/// providers at, so no real AI CLI is required to exercise the pipeline.
pub fn fake_agent_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_agent.sh")
}

/// A provider registry with a single `fake` entry backed by the canned
/// shell agent, standing in for `claude`/`kiro` in scenario tests.
pub fn fake_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_builtins();
    registry.register(CommandConfig {
        name: "fake".to_string(),
        binary: fake_agent_path().to_string_lossy().into_owned(),
        subcommand: None,
        prompt_flag: None,
        permission_flags: vec![],
        extra_flags: vec![],
        strip_ansi: false,
    });
    registry
}

fn phase(name: &str, kind: PhaseKind, retry_target: Option<&str>) -> PhaseDefinition {
    PhaseDefinition {
        name: name.to_string(),
        kind,
        retry_target: retry_target.map(str::to_string),
        condition: None,
        provider: None,
        timeout_secs: 10,
        max_retries: 3,
        gate: None,
    }
}

/// The six-phase pipeline from spec §8's concrete scenarios:
/// test-writer/test-review and execute/execute-review as worker/reviewer
/// pairs, sign-off and merge as standalone phases.
pub fn six_phase_pipeline() -> Vec<PhaseDefinition> {
    vec![
        phase("test-writer", PhaseKind::Worker, None),
        phase("test-review", PhaseKind::Reviewer, Some("test-writer")),
        phase("execute", PhaseKind::Worker, None),
        phase("execute-review", PhaseKind::Reviewer, Some("execute")),
        phase("sign-off", PhaseKind::Reviewer, Some("execute")),
        phase("merge", PhaseKind::Worker, None),
    ]
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("failed to run git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// A throwaway git repository with one commit on its default branch, ready
/// to serve as the `repo_root` for a `GitWorktree`.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# test repo\n").unwrap();
    git(dir, &["add", "README.md"]);
    git(dir, &["commit", "-q", "-m", "initial commit"]);
}

/// Name of the branch `git init` created HEAD on, needed since it varies
/// with the caller's global `init.defaultBranch`.
pub fn current_branch(dir: &Path) -> String {
    let out = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .expect("failed to run git rev-parse");
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}
