use crate::config::{Config, SupervisorConfig};
use crate::git::GitRepo;
use crate::notify::{EventKind, Notifier};
use crate::paths::Paths;
use crate::state::{StateFile, WatchdogState};
use crate::sys;
use chrono::Utc;
use color_eyre::eyre::WrapErr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Consecutive fast crashes that trigger a rollback to last-known-good.
pub const FAST_CRASH_LIMIT: u32 = 3;

const CRASH_BACKOFF_BASE_MS: u64 = 1000;
const CRASH_BACKOFF_CAP_MS: u64 = 60_000;

/// What a supervisor exit code means to the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// 0: orderly stop, the watchdog is done.
    Shutdown,
    /// 42: new code is in the work tree; sync dependencies, then relaunch.
    Update,
    /// 43/44: deliberate restart, relaunch as-is.
    Relaunch,
    /// Anything else (including signal death): a crash.
    Crash,
}

pub fn classify_exit(code: Option<i32>) -> ExitKind {
    match code {
        Some(0) => ExitKind::Shutdown,
        Some(42) => ExitKind::Update,
        Some(43) | Some(44) => ExitKind::Relaunch,
        _ => ExitKind::Crash,
    }
}

/// Delay before relaunching after crash number `consecutive` (1-based).
pub fn crash_backoff(consecutive: u32) -> Duration {
    let exp = consecutive.saturating_sub(1);
    let ms = CRASH_BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(exp));
    Duration::from_millis(ms.clamp(CRASH_BACKOFF_BASE_MS, CRASH_BACKOFF_CAP_MS))
}

/// Fold one observed supervisor exit into the persisted state. A run at or
/// past the stability threshold wipes the crash streak and promotes the
/// current commit to last-known-good; deliberate restart exits are neutral;
/// only crashes below the threshold count toward the limit. Returns true
/// when the streak has reached the rollback limit.
pub fn record_exit(
    state: &mut WatchdogState,
    exit: ExitKind,
    run_duration: Duration,
    stability_threshold: Duration,
    current_commit: Option<&str>,
) -> bool {
    if run_duration >= stability_threshold {
        state.consecutive_fast_crashes = 0;
        if let Some(commit) = current_commit {
            state.last_known_good_commit = Some(commit.to_string());
        }
        return false;
    }

    if exit == ExitKind::Crash {
        state.consecutive_fast_crashes += 1;
    }
    state.consecutive_fast_crashes >= FAST_CRASH_LIMIT
}

enum Observation {
    Exited(Option<i32>),
    Interrupted,
}

/// The outer loop: relaunches the supervisor forever, interpreting its exit
/// codes, and falls back to the last-known-good commit when fresh code
/// keeps dying on startup.
pub struct Watchdog {
    supervisor: SupervisorConfig,
    config_path: PathBuf,
    repo: GitRepo,
    state_file: StateFile,
    notifier: Notifier,
}

impl Watchdog {
    pub fn new(config: &Config, config_path: PathBuf, paths: &Paths) -> Self {
        let sup = config.supervisor.clone();
        let repo = GitRepo::new(&sup.repo_dir, &sup.remote, &sup.branch);
        let notifier = Notifier::new(sup.notify_command.clone());
        Self {
            supervisor: sup,
            config_path,
            repo,
            state_file: StateFile::new(paths.state_file()),
            notifier,
        }
    }

    pub async fn run(&self) -> color_eyre::Result<i32> {
        let threshold = Duration::from_secs(self.supervisor.stability_threshold);
        let mut state = self.state_file.load();
        info!(
            last_known_good = ?state.last_known_good_commit,
            crashes = state.consecutive_fast_crashes,
            "watchdog starting"
        );

        loop {
            state.last_start_time = Some(Utc::now());
            self.persist(&state);

            let started = tokio::time::Instant::now();
            let observation = self.run_supervisor().await?;
            let run_duration = started.elapsed();

            let code = match observation {
                Observation::Interrupted => {
                    info!("watchdog interrupted, supervisor stopped");
                    return Ok(0);
                }
                Observation::Exited(code) => code,
            };

            let kind = classify_exit(code);
            let commit = self.repo.current_commit().await.ok();
            let rollback_due = record_exit(&mut state, kind, run_duration, threshold, commit.as_deref());
            self.persist(&state);

            info!(?code, ?kind, secs = run_duration.as_secs(), "supervisor exited");

            match kind {
                ExitKind::Shutdown => return Ok(0),
                ExitKind::Update => {
                    self.sync_deps().await;
                }
                ExitKind::Relaunch => {}
                ExitKind::Crash => {
                    if rollback_due {
                        self.rollback(&mut state).await;
                    } else {
                        let delay = crash_backoff(state.consecutive_fast_crashes);
                        warn!(
                            crashes = state.consecutive_fast_crashes,
                            delay_ms = delay.as_millis() as u64,
                            "supervisor crashed, backing off before relaunch"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn run_supervisor(&self) -> color_eyre::Result<Observation> {
        let exe = std::env::current_exe().wrap_err("cannot locate own executable")?;
        let mut cmd = tokio::process::Command::new(exe);
        cmd.arg("--supervisor")
            .arg("--config")
            .arg(&self.config_path)
            .current_dir(&self.supervisor.repo_dir);

        let mut child = cmd.spawn().wrap_err("failed to launch supervisor")?;

        tokio::select! {
            status = child.wait() => {
                let status = status.wrap_err("failed to wait for supervisor")?;
                Ok(Observation::Exited(status.code()))
            }
            _ = sys::signal_shutdown() => {
                // Pass the shutdown along and give it a clean exit
                if let Some(pid) = child.id()
                    && let Ok(signal) = sys::parse_signal("SIGTERM")
                {
                    let _ = sys::send_signal(pid, signal);
                }
                let _ = child.wait().await;
                Ok(Observation::Interrupted)
            }
        }
    }

    /// Three fast crashes in a row: the new code is broken. Pin the work
    /// tree back to the last commit that held up, resync dependencies, and
    /// hand the scene to the recovery command if one is configured.
    async fn rollback(&self, state: &mut WatchdogState) {
        match state.last_known_good_commit.clone() {
            Some(commit) => {
                self.notifier.notify(
                    EventKind::Rollback,
                    &format!(
                        "{FAST_CRASH_LIMIT} fast crashes in a row, rolling back to {commit}"
                    ),
                );
                if let Err(e) = self.repo.sync_to(&commit).await {
                    error!(error = %e, commit, "rollback reset failed");
                }
                self.sync_deps().await;
            }
            None => {
                warn!("fast-crash limit hit but no known-good commit, relaunching as-is");
            }
        }

        state.consecutive_fast_crashes = 0;
        self.persist(state);
        self.run_recovery().await;
    }

    async fn sync_deps(&self) {
        let Some(ref install) = self.supervisor.install_command else {
            return;
        };
        info!(command = %install, "syncing dependencies");
        let result = sys::hook_command(install)
            .current_dir(&self.supervisor.repo_dir)
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(?status, "install command failed"),
            Err(e) => warn!(error = %e, "install command could not run"),
        }
    }

    async fn run_recovery(&self) {
        let Some(ref recovery) = self.supervisor.recovery_command else {
            return;
        };
        self.notifier.notify(
            EventKind::Recovery,
            "launching recovery agent after rollback",
        );
        let result = sys::hook_command(recovery)
            .current_dir(&self.supervisor.repo_dir)
            .status()
            .await;
        match result {
            Ok(status) if status.success() => info!("recovery agent finished"),
            Ok(status) => warn!(?status, "recovery agent failed"),
            Err(e) => warn!(error = %e, "recovery agent could not run"),
        }
    }

    fn persist(&self, state: &WatchdogState) {
        if let Err(e) = self.state_file.save(state) {
            warn!(error = %e, "failed to persist watchdog state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(60);

    #[test]
    fn test_classify_exit_table() {
        assert_eq!(classify_exit(Some(0)), ExitKind::Shutdown);
        assert_eq!(classify_exit(Some(42)), ExitKind::Update);
        assert_eq!(classify_exit(Some(43)), ExitKind::Relaunch);
        assert_eq!(classify_exit(Some(44)), ExitKind::Relaunch);
        assert_eq!(classify_exit(Some(1)), ExitKind::Crash);
        assert_eq!(classify_exit(Some(137)), ExitKind::Crash);
        // Signal death reports no code
        assert_eq!(classify_exit(None), ExitKind::Crash);
    }

    #[test]
    fn test_fast_crashes_count_to_rollback() {
        let mut state = WatchdogState::default();
        let fast = Duration::from_secs(5);

        assert!(!record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 1);
        assert!(!record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 2);
        // Third one trips the limit
        assert!(record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 3);
    }

    #[test]
    fn test_stable_run_resets_and_promotes_commit() {
        let mut state = WatchdogState {
            consecutive_fast_crashes: 2,
            ..Default::default()
        };
        let stable = Duration::from_secs(120);

        assert!(!record_exit(&mut state, ExitKind::Crash, stable, THRESHOLD, Some("abc123")));
        assert_eq!(state.consecutive_fast_crashes, 0);
        assert_eq!(state.last_known_good_commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_stable_run_without_commit_keeps_old_known_good() {
        let mut state = WatchdogState {
            last_known_good_commit: Some("old456".to_string()),
            ..Default::default()
        };
        record_exit(&mut state, ExitKind::Shutdown, Duration::from_secs(90), THRESHOLD, None);
        assert_eq!(state.last_known_good_commit.as_deref(), Some("old456"));
    }

    #[test]
    fn test_deliberate_restarts_do_not_count() {
        let mut state = WatchdogState::default();
        let fast = Duration::from_secs(1);

        // Restart churn right after launch is expected, not a crash
        assert!(!record_exit(&mut state, ExitKind::Update, fast, THRESHOLD, None));
        assert!(!record_exit(&mut state, ExitKind::Relaunch, fast, THRESHOLD, None));
        assert!(!record_exit(&mut state, ExitKind::Shutdown, fast, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 0);
    }

    #[test]
    fn test_fourth_crash_counts_from_one_after_rollback() {
        let mut state = WatchdogState::default();
        let fast = Duration::from_secs(5);

        for _ in 0..3 {
            record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None);
        }
        // The rollback path clears the counter
        state.consecutive_fast_crashes = 0;

        assert!(!record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 1);
    }

    #[test]
    fn test_crash_streak_interleaved_with_stable_run() {
        let mut state = WatchdogState::default();
        let fast = Duration::from_secs(5);
        let stable = Duration::from_secs(61);

        record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None);
        record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None);
        record_exit(&mut state, ExitKind::Crash, stable, THRESHOLD, Some("good789"));
        assert_eq!(state.consecutive_fast_crashes, 0);

        // Streak restarts from scratch
        assert!(!record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert!(!record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
        assert!(record_exit(&mut state, ExitKind::Crash, fast, THRESHOLD, None));
    }

    #[test]
    fn test_exactly_threshold_counts_as_stable() {
        let mut state = WatchdogState::default();
        assert!(!record_exit(&mut state, ExitKind::Crash, THRESHOLD, THRESHOLD, None));
        assert_eq!(state.consecutive_fast_crashes, 0);
    }

    #[test]
    fn test_crash_backoff_floor_and_cap() {
        assert_eq!(crash_backoff(0), Duration::from_secs(1));
        assert_eq!(crash_backoff(1), Duration::from_secs(1));
        assert_eq!(crash_backoff(2), Duration::from_secs(2));
        assert_eq!(crash_backoff(3), Duration::from_secs(4));
        assert_eq!(crash_backoff(10), Duration::from_secs(60));
    }
}
