use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use capsule::adapters::conflict_resolver::PipelinePairResolver;
use capsule::adapters::issue_tracker::{IssueTracker, YamlIssueTracker};
use capsule::adapters::prompt::{FilePromptLoader, PromptLoader};
use capsule::adapters::worklog::FileWorklog;
use capsule::adapters::worktree::{GitWorktree, Worktree};
use capsule::campaign::{
    run_campaign, CampaignConfig, CampaignError, PostTaskHook, PostTaskOutcome, TaskRunner,
    ValidationPhase,
};
use capsule::campaign_state::FileCampaignStateStore;
use capsule::checkpoint::{CheckpointStore, FileCheckpointStore};
use capsule::config::{self, CliOverrides, Config};
use capsule::engine::{Gate, ShellGate};
use capsule::events::PlainTextObserver;
use capsule::hooks::PostPipelineHook;
use capsule::log::parse_log_level;
use capsule::pipeline::{pause_flag, run_pipeline, PipelineConfig, PipelineOutcome, StatusObserver};
use capsule::preflight::run_preflight;
use capsule::provider::kill_all_children;
use capsule::provider_registry::ProviderRegistry;
use capsule::types::{CampaignStatus, PipelineInput, TaskStatus};
use capsule::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(
    name = "capsule",
    about = "Drives an AI coding agent through a deterministic TDD pipeline",
    disable_version_flag = true
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print `<version> <commit> <date>` and exit
    #[arg(long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single bead's pipeline end to end
    Run {
        bead_id: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
        /// Force plain-text status output even when stdout is a TTY
        #[arg(long)]
        no_tui: bool,
    },
    /// Run a campaign rooted at a feature/epic bead
    Campaign {
        parent_id: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Launch the interactive dashboard (requires a TTY)
    Dashboard,
    /// Remove the worktree for a bead, preserving its branch
    Abort { bead_id: String },
    /// Remove the worktree and its branch, pruning metadata
    Clean { bead_id: String },
}

/// What the process should report to the user and which code it should
/// exit with, per the exit-code table: 0 success, 1 pipeline failure,
/// 2 setup error, 3 paused.
enum ExitOutcome {
    Success,
    PipelineFailure(String),
    SetupError(String),
    Paused(String),
}

impl ExitOutcome {
    fn code(&self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::PipelineFailure(_) => 1,
            ExitOutcome::SetupError(_) => 2,
            ExitOutcome::Paused(_) => 3,
        }
    }
}

fn version_string() -> String {
    format!(
        "{} {} {}",
        env!("CARGO_PKG_VERSION"),
        option_env!("CAPSULE_COMMIT").unwrap_or("unknown"),
        option_env!("CAPSULE_BUILD_DATE").unwrap_or("unknown"),
    )
}

/// SIGINT/SIGTERM once sets the process-wide pause flag, which the pipeline
/// and campaign runners consult only at phase/task boundaries. A second
/// signal force-quits without cleanup — that policy lives here, in the CLI,
/// not in the orchestrator (see spec's cancellation semantics).
fn install_signal_handlers() -> Result<(), String> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| format!("failed to register signal handlers: {e}"))?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            if pause_flag().load(std::sync::atomic::Ordering::Relaxed) {
                log_error!("second interrupt received, killing running providers");
                kill_all_children();
                std::process::exit(130);
            }
            log_info!("interrupt received, pausing at next phase boundary");
            pause_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    Ok(())
}

/// Bundles everything a single bead-pipeline invocation needs, shared
/// between the `run` command and the campaign runner's `TaskRunner`.
/// Resolves a bead, but a not-found error is a warning, not a hard failure
/// (spec 4.12/7): the pipeline proceeds against a minimal placeholder bead
/// built from just the id, rather than aborting outright. Any other tracker
/// error (I/O, malformed store) still propagates.
async fn resolve_bead_or_warn(tracker: &dyn IssueTracker, bead_id: &str) -> Result<capsule::types::Bead, String> {
    use capsule::adapters::issue_tracker::IssueTrackerError;
    match tracker.resolve(bead_id).await {
        Ok(bead) => Ok(bead),
        Err(IssueTrackerError::NotFound(_)) => {
            log_warn!("[main] bead `{bead_id}` not found in issue tracker; continuing with minimal context");
            let now = chrono::Utc::now();
            Ok(capsule::types::Bead {
                id: bead_id.to_string(),
                title: bead_id.to_string(),
                description: String::new(),
                acceptance_criteria: String::new(),
                issue_type: capsule::types::IssueType::Task,
                status: capsule::types::BeadStatus::Open,
                priority: 0,
                parent_id: None,
                dependencies: vec![],
                created: now,
                updated: now,
            })
        }
        Err(e) => Err(e.to_string()),
    }
}

struct Runtime {
    config: Config,
    registry: ProviderRegistry,
    worktree: GitWorktree,
    issue_tracker: YamlIssueTracker,
    worklog: FileWorklog,
    checkpoint_store: Option<FileCheckpointStore>,
    prompt_loader: Option<FilePromptLoader>,
}

impl Runtime {
    fn new(root: &Path, config: Config) -> Self {
        let worktrees_dir = config.worktree_base_dir.join("worktrees");
        let checkpoint_store = if config.checkpoint_enabled {
            Some(FileCheckpointStore::new(config.worktree_base_dir.join("checkpoints")))
        } else {
            None
        };
        let prompt_loader = config.prompt_templates_dir.as_ref().map(FilePromptLoader::new);
        Runtime {
            registry: ProviderRegistry::with_builtins(),
            worktree: GitWorktree::new(root, worktrees_dir.clone()),
            issue_tracker: YamlIssueTracker::new(config.worktree_base_dir.join("beads.yaml")),
            worklog: FileWorklog::new(worktrees_dir, config.worktree_base_dir.join("logs")),
            checkpoint_store,
            prompt_loader,
            config,
        }
    }

    fn prompt_loader(&self) -> Option<&dyn PromptLoader> {
        self.prompt_loader.as_ref().map(|l| l as &dyn PromptLoader)
    }

    async fn run_bead_pipeline(
        &self,
        bead_id: &str,
        observer: &dyn StatusObserver,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, String> {
        let bead = resolve_bead_or_warn(&self.issue_tracker, bead_id).await?;
        let work_dir = self
            .worktree
            .create(bead_id)
            .await
            .map_err(|e| e.to_string())?;

        if !work_dir.join("worklog.md").exists() {
            if let Err(e) = self.worklog.create(bead_id, &bead.acceptance_criteria).await {
                log_warn!("[main] failed to create worklog for `{bead_id}`: {e}");
            }
        }

        let input = PipelineInput {
            bead_id: bead_id.to_string(),
            title: bead.title,
            description: bead.description,
            bead_context: bead.acceptance_criteria,
            sibling_context: None,
            skip_phases: HashSet::new(),
        };

        let gate: &dyn Gate = &ShellGate;
        let pipeline_cfg = PipelineConfig {
            phases: &self.config.phases,
            registry: &self.registry,
            default_provider: &self.config.provider,
            retry_defaults: &self.config.retry_defaults,
            checkpoint_store: self.checkpoint_store.as_ref().map(|s| s as &dyn CheckpointStore),
            gate: Some(gate),
            prompt_loader: self.prompt_loader(),
        };

        let outcome = run_pipeline(&pipeline_cfg, &input, &work_dir, observer, cancel)
            .await
            .map_err(|e| e.to_string())?;

        if let PipelineOutcome::Completed(output) = &outcome {
            for result in &output.phase_results {
                let outcome_label = format!("{:?}", result.status);
                let summary = result.signal.as_ref().map(|s| s.summary.as_str()).unwrap_or("");
                if let Err(e) = self.worklog.append(bead_id, &result.phase, &outcome_label, summary).await {
                    log_warn!("[main] failed to append worklog entry for `{bead_id}`/`{}`: {e}", result.phase);
                }
            }
        }

        Ok(outcome)
    }

    async fn close_out(&self, bead_id: &str) -> Result<(), String> {
        let resolver = PipelinePairResolver {
            worktree: &self.worktree,
            phases: &self.config.phases,
            registry: &self.registry,
            default_provider: &self.config.provider,
            retry_defaults: &self.config.retry_defaults,
        };
        let hook = PostPipelineHook {
            worktree: &self.worktree,
            worklog: &self.worklog,
            issue_tracker: &self.issue_tracker,
            conflict_resolver: Some(&resolver as &dyn capsule::hooks::ConflictResolver),
            main_branch_override: None,
            max_conflict_attempts: 3,
        };
        match hook.run(bead_id, &format!("capsule: complete {bead_id}")).await? {
            capsule::hooks::HookOutcome::Merged { .. } => Ok(()),
            capsule::hooks::HookOutcome::UnresolvedConflict => {
                Err(format!("unresolved merge conflict for `{bead_id}`"))
            }
        }
    }
}

#[async_trait::async_trait]
impl TaskRunner for Runtime {
    async fn run_task(&self, bead_id: &str) -> Result<Vec<capsule::types::PhaseResult>, String> {
        let cancel = CancellationToken::new();
        match self
            .run_bead_pipeline(bead_id, &PlainTextObserver, &cancel)
            .await?
        {
            PipelineOutcome::Completed(output) if output.completed => Ok(output.phase_results),
            PipelineOutcome::Completed(_) => Err(format!("pipeline for `{bead_id}` did not complete")),
            PipelineOutcome::Paused => Err(format!("pipeline for `{bead_id}` paused")),
        }
    }
}

#[async_trait::async_trait]
impl PostTaskHook for Runtime {
    async fn on_task_complete(&self, bead_id: &str, task_succeeded: bool) -> PostTaskOutcome {
        if !task_succeeded {
            return PostTaskOutcome::Ok;
        }
        match self.close_out(bead_id).await {
            Ok(()) => PostTaskOutcome::Ok,
            Err(e) if e.contains("unresolved merge conflict") => PostTaskOutcome::UnresolvedMergeConflict,
            Err(e) => PostTaskOutcome::Warning(e),
        }
    }
}

#[async_trait::async_trait]
impl ValidationPhase for Runtime {
    async fn validate(&self, parent_id: &str) -> Result<(), String> {
        if self.config.validation_phases.is_empty() {
            return Ok(());
        }
        let phases: Vec<_> = self
            .config
            .phases
            .iter()
            .filter(|p| self.config.validation_phases.contains(&p.name))
            .cloned()
            .collect();
        if phases.is_empty() {
            return Ok(());
        }

        let bead = resolve_bead_or_warn(&self.issue_tracker, parent_id).await?;
        let work_dir = self.worktree.create(parent_id).await.map_err(|e| e.to_string())?;
        let input = PipelineInput {
            bead_id: parent_id.to_string(),
            title: bead.title,
            description: bead.description,
            bead_context: bead.acceptance_criteria,
            sibling_context: None,
            skip_phases: HashSet::new(),
        };
        let gate: &dyn Gate = &ShellGate;
        let pipeline_cfg = PipelineConfig {
            phases: &phases,
            registry: &self.registry,
            default_provider: &self.config.provider,
            retry_defaults: &self.config.retry_defaults,
            checkpoint_store: None,
            gate: Some(gate),
            prompt_loader: self.prompt_loader(),
        };
        let cancel = CancellationToken::new();
        match run_pipeline(&pipeline_cfg, &input, &work_dir, &PlainTextObserver, &cancel)
            .await
            .map_err(|e| e.to_string())?
        {
            PipelineOutcome::Completed(output) if output.completed => Ok(()),
            PipelineOutcome::Completed(_) => Err("validation phases did not complete".to_string()),
            PipelineOutcome::Paused => Err("validation paused".to_string()),
        }
    }
}

fn user_config_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config/capsule/config.yaml")
}

fn load_runtime_config(root: &Path, provider: Option<String>, timeout: Option<u64>) -> Result<Config, ExitOutcome> {
    let overrides = CliOverrides { provider, timeout };
    config::load_config(&user_config_path(), &root.join(".capsule/config.yaml"), &overrides)
        .map_err(|e| ExitOutcome::SetupError(e.to_string()))
}

async fn handle_run(
    root: &Path,
    bead_id: &str,
    provider: Option<String>,
    timeout: Option<u64>,
    _no_tui: bool,
) -> ExitOutcome {
    let config = match load_runtime_config(root, provider, timeout) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let registry = ProviderRegistry::with_builtins();
    let preflight_errors = run_preflight(&config.phases, &registry, &config.provider);
    if !preflight_errors.is_empty() {
        let msg = preflight_errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        return ExitOutcome::SetupError(msg);
    }

    let runtime = Runtime::new(root, config);
    let cancel = CancellationToken::new();
    match runtime.run_bead_pipeline(bead_id, &PlainTextObserver, &cancel).await {
        Ok(PipelineOutcome::Paused) => ExitOutcome::Paused(bead_id.to_string()),
        Ok(PipelineOutcome::Completed(output)) if output.completed => {
            match runtime.close_out(bead_id).await {
                Ok(()) => ExitOutcome::Success,
                Err(e) => ExitOutcome::PipelineFailure(e),
            }
        }
        Ok(PipelineOutcome::Completed(_)) => {
            ExitOutcome::PipelineFailure(format!("pipeline for `{bead_id}` did not complete"))
        }
        Err(e) => ExitOutcome::PipelineFailure(e),
    }
}

async fn handle_campaign(root: &Path, parent_id: &str, provider: Option<String>, timeout: Option<u64>) -> ExitOutcome {
    let config = match load_runtime_config(root, provider, timeout) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let registry = ProviderRegistry::with_builtins();
    let preflight_errors = run_preflight(&config.phases, &registry, &config.provider);
    if !preflight_errors.is_empty() {
        let msg = preflight_errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        return ExitOutcome::SetupError(msg);
    }

    let failure_mode = config.failure_mode.clone();
    let circuit_breaker = config.circuit_breaker;
    let runtime = Runtime::new(root, config);
    let state_store = FileCampaignStateStore::new(runtime.config.worktree_base_dir.join("campaigns"));

    let cfg = CampaignConfig {
        issue_tracker: &runtime.issue_tracker,
        state_store: &state_store,
        task_runner: &runtime,
        post_task_hook: Some(&runtime as &dyn PostTaskHook),
        validation_phase: Some(&runtime as &dyn ValidationPhase),
        failure_mode,
        circuit_breaker,
    };

    let mut visited = HashSet::new();
    let cancel = CancellationToken::new();
    match run_campaign(&cfg, parent_id, 0, &mut visited, &cancel).await {
        Ok(state) if state.status == CampaignStatus::Completed => ExitOutcome::Success,
        Ok(state) if state.status == CampaignStatus::Paused => ExitOutcome::Paused(parent_id.to_string()),
        Ok(state) => {
            let failed: Vec<_> = state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.bead_id.clone())
                .collect();
            ExitOutcome::PipelineFailure(format!("campaign ended as {:?}; failed tasks: {failed:?}", state.status))
        }
        Err(CampaignError::Cancelled) => ExitOutcome::Paused(parent_id.to_string()),
        Err(e) => ExitOutcome::PipelineFailure(e.to_string()),
    }
}

/// Full interactive rendering is an observer's concern, not the
/// orchestrator's; this only honors the TTY precondition from the CLI
/// surface contract and drains the same event stream a real dashboard
/// would attach to.
fn handle_dashboard() -> ExitOutcome {
    if !std::io::stdout().is_terminal() {
        return ExitOutcome::SetupError("dashboard requires an interactive terminal".to_string());
    }
    println!("capsule dashboard: no run is currently attached in this process");
    ExitOutcome::Success
}

async fn handle_abort(root: &Path, bead_id: &str) -> ExitOutcome {
    let config = match load_runtime_config(root, None, None) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let worktree = GitWorktree::new(root, config.worktree_base_dir.join("worktrees"));
    match worktree.exists(bead_id).await {
        Ok(true) => {}
        Ok(false) => return ExitOutcome::SetupError(format!("no worktree for `{bead_id}`")),
        Err(e) => return ExitOutcome::SetupError(e.to_string()),
    }
    match worktree.remove(bead_id, false).await {
        Ok(()) => ExitOutcome::Success,
        Err(e) => ExitOutcome::PipelineFailure(e.to_string()),
    }
}

async fn handle_clean(root: &Path, bead_id: &str) -> ExitOutcome {
    let config = match load_runtime_config(root, None, None) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let worktree = GitWorktree::new(root, config.worktree_base_dir.join("worktrees"));
    match worktree.exists(bead_id).await {
        Ok(true) => {}
        Ok(false) => return ExitOutcome::SetupError(format!("no worktree for `{bead_id}`")),
        Err(e) => return ExitOutcome::SetupError(e.to_string()),
    }
    if let Err(e) = worktree.remove(bead_id, true).await {
        return ExitOutcome::PipelineFailure(e.to_string());
    }
    match worktree.prune().await {
        Ok(()) => ExitOutcome::Success,
        Err(e) => ExitOutcome::PipelineFailure(e.to_string()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", version_string());
        std::process::exit(0);
    }

    match parse_log_level(&cli.log_level) {
        Ok(level) => capsule::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }

    if let Err(e) = install_signal_handlers() {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let Some(command) = cli.command else {
        eprintln!("Error: no subcommand given (try `capsule run <bead-id>`)");
        std::process::exit(2);
    };

    let outcome = match command {
        Commands::Run { bead_id, provider, timeout, no_tui } => {
            handle_run(&cli.root, &bead_id, provider, timeout, no_tui).await
        }
        Commands::Campaign { parent_id, provider, timeout } => {
            handle_campaign(&cli.root, &parent_id, provider, timeout).await
        }
        Commands::Dashboard => handle_dashboard(),
        Commands::Abort { bead_id } => handle_abort(&cli.root, &bead_id).await,
        Commands::Clean { bead_id } => handle_clean(&cli.root, &bead_id).await,
    };

    match &outcome {
        ExitOutcome::Success => {}
        ExitOutcome::Paused(bead_id) => {
            println!("Pipeline paused; resume bead {bead_id} with the same command to continue from checkpoint");
        }
        ExitOutcome::PipelineFailure(msg) => log_error!("{msg}"),
        ExitOutcome::SetupError(msg) => log_error!("{msg}"),
    }

    std::process::exit(outcome.code());
}
