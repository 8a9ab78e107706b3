use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::{setpgid, Pid};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::signal::{parse_signal, SignalParseError};
use crate::types::Signal;
use crate::{log_debug, log_warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const SIGTERM_GRACE_PERIOD: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static CHILDREN: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();

/// Lazily-initialized process-wide shutdown flag, flipped by the CLI's
/// signal handler so in-flight provider calls can wind down promptly.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

fn children() -> &'static Mutex<HashSet<i32>> {
    CHILDREN.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_child(pgid: i32) {
    children().lock().expect("children registry poisoned").insert(pgid);
}

fn unregister_child(pgid: i32) {
    children().lock().expect("children registry poisoned").remove(&pgid);
}

/// Send SIGTERM to every process group spawned by this run. Called from the
/// CLI's signal handler; best-effort, never panics on a stale pid.
pub fn kill_all_children() {
    let pgids: Vec<i32> = children()
        .lock()
        .expect("children registry poisoned")
        .iter()
        .copied()
        .collect();
    for pgid in pgids {
        let _ = kill(Pid::from_raw(-pgid), NixSignal::SIGTERM);
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider `{0}` timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("provider `{0}` exited with non-zero status: {1}")]
    NonZeroExit(String, i32),
    #[error("failed to spawn provider `{0}`: {1}")]
    Spawn(String, std::io::Error),
    #[error("provider call was cancelled")]
    Cancelled,
    #[error(transparent)]
    SignalParse(#[from] SignalParseError),
}

/// Data-driven description of how to invoke a particular agent CLI. A
/// `Provider` is entirely described by one of these; there is no per-tool
/// Rust type.
#[derive(Clone, Debug)]
pub struct CommandConfig {
    pub name: String,
    pub binary: String,
    pub subcommand: Option<String>,
    /// `None` means the prompt is passed positionally rather than behind a flag.
    pub prompt_flag: Option<String>,
    pub permission_flags: Vec<String>,
    pub extra_flags: Vec<String>,
    pub strip_ansi: bool,
}

impl CommandConfig {
    pub fn claude() -> Self {
        CommandConfig {
            name: "claude".to_string(),
            binary: "claude".to_string(),
            subcommand: None,
            prompt_flag: Some("-p".to_string()),
            permission_flags: vec!["--dangerously-skip-permissions".to_string()],
            extra_flags: vec![],
            strip_ansi: false,
        }
    }

    pub fn kiro() -> Self {
        CommandConfig {
            name: "kiro".to_string(),
            binary: "kiro".to_string(),
            subcommand: Some("chat".to_string()),
            prompt_flag: None,
            permission_flags: vec![],
            extra_flags: vec!["--no-wrap".to_string(), "--trust-all-tools".to_string()],
            strip_ansi: true,
        }
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(sub) = &self.subcommand {
            args.push(sub.clone());
        }
        args.extend(self.permission_flags.iter().cloned());
        args.extend(self.extra_flags.iter().cloned());
        match &self.prompt_flag {
            Some(flag) => {
                args.push(flag.clone());
                args.push(prompt.to_string());
            }
            None => args.push(prompt.to_string()),
        }
        args
    }
}

/// Raw captured output of a provider invocation, with signal extraction
/// deferred so the phase engine controls exactly when/whether to parse.
pub struct ProviderOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ProviderOutput {
    pub fn parse_signal(&self) -> Result<Signal, SignalParseError> {
        parse_signal(&self.stdout)
    }
}

pub struct Provider {
    config: CommandConfig,
}

impl Provider {
    pub fn new(config: CommandConfig) -> Self {
        Provider { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run the provider's CLI with `prompt` in `work_dir`, enforcing `timeout`
    /// (zero means no deadline) and aborting promptly if `cancel` fires.
    pub async fn execute(
        &self,
        prompt: &str,
        work_dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutput, ProviderError> {
        let args = self.config.build_args(prompt);
        log_debug!(
            "[provider:{}] spawning {} {:?} in {}",
            self.config.name,
            self.config.binary,
            args,
            work_dir.display()
        );

        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Isolate the child in its own process group so a timeout/cancel kill
        // reaches anything it spawns, without touching our own group.
        unsafe {
            command.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProviderError::Spawn(self.config.name.clone(), e))?;
        let pid = child.id().ok_or_else(|| {
            ProviderError::Spawn(
                self.config.name.clone(),
                std::io::Error::other("child exited before pid was observable"),
            )
        })? as i32;
        register_child(pid);

        let wait_result = if timeout.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RunOutcome::Cancelled),
                out = child.wait_with_output() => Ok(out),
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RunOutcome::Cancelled),
                _ = tokio::time::sleep(timeout) => Err(RunOutcome::TimedOut),
                out = child.wait_with_output() => Ok(out),
            }
        };

        let output = match wait_result {
            Ok(Ok(out)) => {
                unregister_child(pid);
                out
            }
            Ok(Err(e)) => {
                unregister_child(pid);
                return Err(ProviderError::Spawn(self.config.name.clone(), e));
            }
            Err(RunOutcome::TimedOut) => {
                kill_process_group(pid).await;
                unregister_child(pid);
                return Err(ProviderError::Timeout(self.config.name.clone(), timeout));
            }
            Err(RunOutcome::Cancelled) => {
                kill_process_group(pid).await;
                unregister_child(pid);
                return Err(ProviderError::Cancelled);
            }
        };

        if shutdown_flag().load(Ordering::Relaxed) {
            return Err(ProviderError::Cancelled);
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            log_warn!(
                "[provider:{}] exited with {:?}: {}",
                self.config.name,
                output.status.code(),
                stderr.lines().last().unwrap_or("")
            );
            return Err(ProviderError::NonZeroExit(
                self.config.name.clone(),
                output.status.code().unwrap_or(-1),
            ));
        }

        let stdout = if self.config.strip_ansi {
            strip_ansi(&stdout)
        } else {
            stdout
        };

        Ok(ProviderOutput { stdout, stderr })
    }
}

enum RunOutcome {
    TimedOut,
    Cancelled,
}

/// SIGTERM the child's process group, give it `SIGTERM_GRACE_PERIOD` to exit,
/// then SIGKILL. Runs on a blocking task since it polls synchronously.
async fn kill_process_group(pid: i32) {
    let pgid = Pid::from_raw(-pid);
    let _ = tokio::task::spawn_blocking(move || {
        let _ = kill(pgid, NixSignal::SIGTERM);
        let deadline = std::time::Instant::now() + SIGTERM_GRACE_PERIOD;
        while std::time::Instant::now() < deadline {
            // kill(pid, None) probes liveness without sending a signal.
            if kill(Pid::from_raw(pid), None).is_err() {
                return;
            }
            std::thread::sleep(KILL_POLL_INTERVAL);
        }
        let _ = kill(pgid, NixSignal::SIGKILL);
    })
    .await;
}

/// Strip CSI escape sequences (`ESC [ ... letter`) left behind by TUIs that
/// don't respect a non-tty stdout. Only handles the common CSI form; other
/// escape sequences pass through unchanged.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_preset_builds_prompt_flag_args() {
        let cfg = CommandConfig::claude();
        let args = cfg.build_args("do the thing");
        assert_eq!(
            args,
            vec![
                "--dangerously-skip-permissions".to_string(),
                "-p".to_string(),
                "do the thing".to_string(),
            ]
        );
    }

    #[test]
    fn kiro_preset_builds_positional_prompt_args() {
        let cfg = CommandConfig::kiro();
        let args = cfg.build_args("do the thing");
        assert_eq!(
            args,
            vec![
                "chat".to_string(),
                "--no-wrap".to_string(),
                "--trust-all-tools".to_string(),
                "do the thing".to_string(),
            ]
        );
    }

    #[test]
    fn strip_ansi_removes_csi_sequences() {
        let input = "\u{1b}[1mbold\u{1b}[0m plain";
        assert_eq!(strip_ansi(input), "bold plain");
    }

    #[test]
    fn strip_ansi_is_noop_on_plain_text() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }
}
