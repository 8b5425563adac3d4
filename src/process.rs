use crate::config::{ExitAction, ProcessConfig};
use crate::paths::Paths;
use crate::protocol::{ProcessReport, ProcessStatus};
use crate::sys;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";
pub const DEFAULT_MAX_RESTARTS: u32 = 15;
pub const DEFAULT_MIN_UPTIME_MS: u64 = 1000;
pub const DEFAULT_START_GRACE_MS: u64 = 2000;
pub const BACKOFF_BASE_MS: u64 = 100;
pub const BACKOFF_CAP_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("process '{0}' still alive after kill escalation")]
    StopTimeout(String),
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), ProcessError> {
    let words = shell_words::split(command)
        .map_err(|e| ProcessError::InvalidCommand(format!("failed to parse: {e}")))?;

    if words.is_empty() {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    }

    Ok((words[0].clone(), words[1..].to_vec()))
}

// ---------------------------------------------------------------------------
// ManagedProcess
// ---------------------------------------------------------------------------

/// Mutable runtime record for one child. Owned exclusively by the
/// ProcessManager's table; monitors update it through the shared lock.
pub struct ManagedProcess {
    pub name: String,
    pub config: ProcessConfig,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: tokio::time::Instant,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub monitor_shutdown: Option<watch::Sender<bool>>,
}

impl ManagedProcess {
    pub fn to_report(&self) -> ProcessReport {
        ProcessReport {
            name: self.name.clone(),
            pid: self.pid,
            status: self.status,
            uptime: match self.status {
                ProcessStatus::Starting | ProcessStatus::Running => {
                    Some(self.started_at.elapsed().as_secs())
                }
                _ => None,
            },
            restarts: self.restarts,
            last_exit_code: self.last_exit_code,
            optional: self.config.optional,
        }
    }

}

/// Graceful signal, then SIGKILL of the whole process group once the kill
/// timeout expires. Runs without holding the process table, so status
/// reads stay responsive while a slow child winds down.
pub async fn stop_group(name: &str, pid: u32, config: &ProcessConfig) -> Result<(), ProcessError> {
    let signal_name = config.kill_signal.as_deref().unwrap_or(DEFAULT_KILL_SIGNAL);
    let signal = sys::parse_signal(signal_name)?;

    let timeout_ms = config.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS);
    let _ = sys::signal_group(pid, signal);

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while sys::is_pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            // Timeout: take down the entire group so no descendant keeps a
            // port open
            let _ = sys::kill_group(pid);
            tokio::time::sleep(Duration::from_millis(100)).await;
            if sys::is_pid_alive(pid) {
                return Err(ProcessError::StopTimeout(name.to_string()));
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}

pub type ProcessTable = HashMap<String, ManagedProcess>;

// ---------------------------------------------------------------------------
// Monitor events
// ---------------------------------------------------------------------------

/// Emitted by a monitor when a child is beyond local recovery and the
/// supervisor loop has to decide what happens next.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub name: String,
    pub exit_code: Option<i32>,
    pub optional: bool,
}

pub type EscalationSender = mpsc::UnboundedSender<Escalation>;

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

pub async fn spawn_process(
    name: String,
    config: ProcessConfig,
    paths: &Paths,
) -> Result<(ManagedProcess, Child), ProcessError> {
    let (program, args) = parse_command(&config.command)?;

    tokio::fs::create_dir_all(paths.log_dir()).await?;
    let stdout_log = open_append(&paths.stdout_log(&name))?;
    let stderr_log = open_append(&paths.stderr_log(&name))?;

    let mut cmd = Command::new(&program);
    cmd.args(&args);

    if let Some(ref cwd) = config.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(ref env_vars) = config.env {
        cmd.envs(env_vars);
    }

    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::from(stdout_log));
    cmd.stderr(std::process::Stdio::from(stderr_log));

    // Own process group: a later kill_group reaps every descendant
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
    let pid = child.id();

    let (monitor_tx, _monitor_rx) = watch::channel(false);

    let managed = ManagedProcess {
        name,
        config,
        pid,
        status: ProcessStatus::Starting,
        started_at: tokio::time::Instant::now(),
        restarts: 0,
        last_exit_code: None,
        monitor_shutdown: Some(monitor_tx),
    };

    Ok((managed, child))
}

fn open_append(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

// ---------------------------------------------------------------------------
// Exit-code policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Respawn; `backoff` selects delayed vs. immediate.
    Restart { backoff: bool },
    /// Clean stop, leave it down.
    Stop,
    /// Permanently broken or the child asked for parent attention.
    Escalate,
}

/// Pure mapping from (configured policy, observed exit, crash count) to the
/// action the manager takes. The ceiling wins over everything: a process
/// past `max_restarts` escalates no matter what its policy says.
pub fn evaluate_exit(config: &ProcessConfig, exit_code: Option<i32>, restarts: u32) -> ExitOutcome {
    let configured = exit_code.and_then(|code| config.exit_codes.get(&code).copied());

    let outcome = match configured {
        Some(ExitAction::Restart) => ExitOutcome::Restart { backoff: false },
        Some(ExitAction::Backoff) => ExitOutcome::Restart { backoff: true },
        Some(ExitAction::Stop) => ExitOutcome::Stop,
        Some(ExitAction::Escalate) => ExitOutcome::Escalate,
        None => match exit_code {
            Some(0) => ExitOutcome::Stop,
            // Nonzero or signal-killed: crash, retry with backoff
            _ => ExitOutcome::Restart { backoff: true },
        },
    };

    let max_restarts = config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS);
    if matches!(outcome, ExitOutcome::Restart { .. }) && restarts >= max_restarts {
        return ExitOutcome::Escalate;
    }

    outcome
}

/// Exponential backoff delay: 100ms * 2^count, capped at 30s.
pub fn compute_backoff(restart_count: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(restart_count));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

// ---------------------------------------------------------------------------
// Process monitor task
// ---------------------------------------------------------------------------

/// Watches one spawned child: promotes starting -> running once the child
/// survives its start-grace window, and applies the exit-code policy when
/// it dies.
pub fn spawn_monitor(
    name: String,
    mut child: Child,
    monitored_pid: Option<u32>,
    processes: Arc<RwLock<ProcessTable>>,
    paths: Paths,
    escalations: EscalationSender,
) {
    tokio::spawn(async move {
        let grace_ms = {
            let table = processes.read().await;
            table
                .get(&name)
                .and_then(|m| m.config.start_grace)
                .unwrap_or(DEFAULT_START_GRACE_MS)
        };

        let exit_code = match tokio::time::timeout(
            Duration::from_millis(grace_ms),
            child.wait(),
        )
        .await
        {
            // Died inside the grace window: never made it to running
            Ok(status) => status.ok().and_then(|s| s.code()),
            Err(_) => {
                mark_running(&name, monitored_pid, &processes).await;
                child.wait().await.ok().and_then(|s| s.code())
            }
        };

        handle_child_exit(&name, monitored_pid, exit_code, &processes, &paths, &escalations).await;
    });
}

async fn mark_running(
    name: &str,
    monitored_pid: Option<u32>,
    processes: &Arc<RwLock<ProcessTable>>,
) {
    let mut table = processes.write().await;
    if let Some(managed) = table.get_mut(name)
        && managed.pid == monitored_pid
        && managed.status == ProcessStatus::Starting
    {
        managed.status = ProcessStatus::Running;
        debug!(name, "process running");
    }
}

async fn handle_child_exit(
    name: &str,
    monitored_pid: Option<u32>,
    exit_code: Option<i32>,
    processes: &Arc<RwLock<ProcessTable>>,
    paths: &Paths,
    escalations: &EscalationSender,
) {
    let (config, restarts, outcome);

    {
        let mut table = processes.write().await;
        let Some(managed) = table.get_mut(name) else {
            return;
        };

        // Replaced by a manual restart while we were waiting; not ours
        if managed.pid != monitored_pid {
            return;
        }

        managed.last_exit_code = exit_code;

        // Manual stop already in flight: no restart decision to make
        if let Some(ref tx) = managed.monitor_shutdown
            && *tx.borrow()
        {
            managed.status = ProcessStatus::Stopped;
            managed.pid = None;
            return;
        }

        let min_uptime_ms = managed.config.min_uptime.unwrap_or(DEFAULT_MIN_UPTIME_MS);
        if managed.started_at.elapsed() >= Duration::from_millis(min_uptime_ms) {
            // Stable run — forget previous crashes
            managed.restarts = 0;
        }

        config = managed.config.clone();
        restarts = managed.restarts;
        outcome = evaluate_exit(&config, exit_code, restarts);

        match outcome {
            ExitOutcome::Stop => {
                managed.status = if exit_code == Some(0) {
                    ProcessStatus::Stopped
                } else {
                    ProcessStatus::Crashed
                };
                managed.pid = None;
                return;
            }
            ExitOutcome::Escalate => {
                warn!(name, ?exit_code, restarts, "process escalated");
                managed.status = ProcessStatus::Crashed;
                managed.pid = None;
                let _ = escalations.send(Escalation {
                    name: name.to_string(),
                    exit_code,
                    optional: config.optional,
                });
                return;
            }
            ExitOutcome::Restart { .. } => {
                managed.status = ProcessStatus::Crashed;
                managed.pid = None;
            }
        }
    }

    if let ExitOutcome::Restart { backoff: true } = outcome {
        tokio::time::sleep(compute_backoff(restarts)).await;
    }

    // Re-acquire the lock and respawn
    let mut table = processes.write().await;
    let Some(managed) = table.get_mut(name) else {
        return;
    };

    // Shutdown may have been signaled while we were backing off
    if let Some(ref tx) = managed.monitor_shutdown
        && *tx.borrow()
    {
        managed.status = ProcessStatus::Stopped;
        return;
    }

    match spawn_process(name.to_string(), config, paths).await {
        Ok((mut new_managed, new_child)) => {
            new_managed.restarts = restarts + 1;
            new_managed.last_exit_code = exit_code;
            let new_pid = new_managed.pid;
            debug!(name, restarts = new_managed.restarts, "process restarted");
            *managed = new_managed;

            // Drop the lock before spawning the monitor (it reads the table)
            let procs = Arc::clone(processes);
            let p = paths.clone();
            let tx = escalations.clone();
            let n = name.to_string();
            drop(table);
            spawn_monitor(n, new_child, new_pid, procs, p, tx);
        }
        Err(e) => {
            warn!(name, error = %e, "failed to restart process");
            managed.status = ProcessStatus::Crashed;
            managed.pid = None;
            let optional = managed.config.optional;
            let _ = escalations.send(Escalation {
                name: name.to_string(),
                exit_code,
                optional,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    #[test]
    fn test_parse_simple_command() {
        let (prog, args) = parse_command("node bot.js").unwrap();
        assert_eq!(prog, "node");
        assert_eq!(args, vec!["bot.js"]);
    }

    #[test]
    fn test_parse_command_quoted_args() {
        let (prog, args) = parse_command(r#"bash -c "echo hello""#).unwrap();
        assert_eq!(prog, "bash");
        assert_eq!(args, vec!["-c", "echo hello"]);
    }

    #[test]
    fn test_parse_empty_command() {
        let result = parse_command("");
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::InvalidCommand(_)
        ));
    }

    #[test]
    fn test_parse_whitespace_only() {
        let result = parse_command("   ");
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::InvalidCommand(_)
        ));
    }

    // -------------------------------------------------------------------
    // Exit-code policy
    // -------------------------------------------------------------------

    fn cfg_with_codes(codes: &[(i32, ExitAction)]) -> ProcessConfig {
        let mut config = ProcessConfig::new("echo test");
        config.exit_codes = codes.iter().copied().collect();
        config
    }

    #[test]
    fn test_default_policy_exit_zero_stops() {
        let config = ProcessConfig::new("echo test");
        assert_eq!(evaluate_exit(&config, Some(0), 0), ExitOutcome::Stop);
    }

    #[test]
    fn test_default_policy_nonzero_backs_off() {
        let config = ProcessConfig::new("echo test");
        assert_eq!(
            evaluate_exit(&config, Some(1), 0),
            ExitOutcome::Restart { backoff: true }
        );
    }

    #[test]
    fn test_default_policy_signal_killed_backs_off() {
        let config = ProcessConfig::new("echo test");
        assert_eq!(
            evaluate_exit(&config, None, 0),
            ExitOutcome::Restart { backoff: true }
        );
    }

    #[test]
    fn test_configured_restart_is_immediate() {
        let config = cfg_with_codes(&[(42, ExitAction::Restart)]);
        assert_eq!(
            evaluate_exit(&config, Some(42), 0),
            ExitOutcome::Restart { backoff: false }
        );
    }

    #[test]
    fn test_configured_stop_wins_over_default() {
        let config = cfg_with_codes(&[(143, ExitAction::Stop)]);
        assert_eq!(evaluate_exit(&config, Some(143), 0), ExitOutcome::Stop);
    }

    #[test]
    fn test_configured_escalate() {
        let config = cfg_with_codes(&[(51, ExitAction::Escalate)]);
        assert_eq!(evaluate_exit(&config, Some(51), 0), ExitOutcome::Escalate);
    }

    #[test]
    fn test_ceiling_escalates_regardless_of_policy() {
        let mut config = cfg_with_codes(&[(42, ExitAction::Restart)]);
        config.max_restarts = Some(3);
        assert_eq!(
            evaluate_exit(&config, Some(42), 2),
            ExitOutcome::Restart { backoff: false }
        );
        assert_eq!(evaluate_exit(&config, Some(42), 3), ExitOutcome::Escalate);
        assert_eq!(evaluate_exit(&config, Some(1), 4), ExitOutcome::Escalate);
    }

    #[test]
    fn test_ceiling_does_not_affect_stop() {
        let mut config = ProcessConfig::new("echo test");
        config.max_restarts = Some(0);
        assert_eq!(evaluate_exit(&config, Some(0), 5), ExitOutcome::Stop);
    }

    // -------------------------------------------------------------------
    // Backoff
    // -------------------------------------------------------------------

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(compute_backoff(0), Duration::from_millis(100));
        assert_eq!(compute_backoff(1), Duration::from_millis(200));
        assert_eq!(compute_backoff(2), Duration::from_millis(400));
        assert_eq!(compute_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_cap() {
        assert_eq!(compute_backoff(20), Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(compute_backoff(30), Duration::from_millis(BACKOFF_CAP_MS));
    }
}
