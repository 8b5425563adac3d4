use crate::config::Config;
use crate::deploy::{DeployPhase, Deployer, RestartKind, RestartRequest};
use crate::git::{GitPoller, GitRepo, PollOutcome};
use crate::manager::ProcessManager;
use crate::notify::{EventKind, Notifier};
use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response, StatusSnapshot};
use crate::sessions::{DirSessionSource, SessionSource};
use crate::sys;
use color_eyre::eyre::{WrapErr, eyre};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

/// Everything the tick loop and the IPC clients share.
struct Shared {
    manager: ProcessManager,
    deployer: Mutex<Deployer>,
    poller: Mutex<GitPoller>,
    sessions: Box<dyn SessionSource>,
    notifier: Notifier,
    exit_tx: mpsc::Sender<i32>,
}

/// The long-running parent: owns the child fleet, polls for updates, and
/// terminates itself with a kind-specific exit code when a coordinated
/// restart is due. The watchdog interprets that code.
pub struct Supervisor {
    shared: Arc<Shared>,
    paths: Paths,
    tick_interval: Duration,
    exit_rx: mpsc::Receiver<i32>,
}

impl Supervisor {
    pub fn new(config: Config, paths: Paths) -> color_eyre::Result<Self> {
        let sup = config.supervisor;

        let repo_dir = PathBuf::from(&sup.repo_dir);
        let repo = GitRepo::new(&repo_dir, &sup.remote, &sup.branch);
        let poller = GitPoller::new(repo, Duration::from_secs(sup.poll_interval));
        let sessions = DirSessionSource::new(repo_dir.join(&sup.sessions_dir));
        let notifier = Notifier::new(sup.notify_command.clone());

        let manager = ProcessManager::new(config.processes, paths.clone())
            .wrap_err("invalid process configuration")?;

        let (exit_tx, exit_rx) = mpsc::channel(1);
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                deployer: Mutex::new(Deployer::new()),
                poller: Mutex::new(poller),
                sessions: Box::new(sessions),
                notifier,
                exit_tx,
            }),
            paths,
            tick_interval: Duration::from_secs(sup.tick_interval.max(1)),
            exit_rx,
        })
    }

    /// Run until a shutdown signal, a kill request, or a restart decision.
    /// Returns the process exit code the caller should terminate with.
    pub async fn run(mut self) -> color_eyre::Result<i32> {
        if pid::is_supervisor_running(&self.paths)? {
            return Err(eyre!("a supervisor is already running"));
        }

        std::fs::create_dir_all(self.paths.data_dir())
            .wrap_err("failed to create data directory")?;
        pid::write_pid_file(&self.paths).wrap_err("failed to write pid file")?;
        sys::ipc_cleanup(&self.paths).await;
        let listener = sys::ipc_bind(&self.paths)
            .await
            .wrap_err("failed to bind control socket")?;

        if let Err(e) = self.shared.manager.start_all().await {
            self.shutdown_fleet().await;
            return Err(e).wrap_err("failed to start process fleet");
        }
        info!("supervisor running");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let code = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(code) = self.shared.tick_once().await {
                        break code;
                    }
                }
                conn = sys::ipc_accept(&listener) => {
                    match conn {
                        Ok(stream) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(handle_client(shared, stream));
                        }
                        Err(e) => warn!(error = %e, "failed to accept control connection"),
                    }
                }
                code = self.exit_rx.recv() => {
                    break code.unwrap_or(0);
                }
                _ = sys::signal_shutdown() => {
                    info!("shutdown signal received");
                    break 0;
                }
            }
        };

        self.shutdown_fleet().await;
        info!(code, "supervisor exiting");
        Ok(code)
    }

    async fn shutdown_fleet(&self) {
        self.shared.manager.stop_all().await;
        sys::ipc_cleanup(&self.paths).await;
        pid::remove_pid_file(&self.paths);
    }
}

impl Shared {
    /// One pass of the core loop: poll git, route escalations, and gate the
    /// pending restart on session quiescence. Returns an exit code once a
    /// restart fires.
    async fn tick_once(&self) -> Option<i32> {
        let outcome = self.poller.lock().await.poll_due().await;
        if let PollOutcome::UpdateAvailable { target_ref } = outcome {
            let mut deployer = self.deployer.lock().await;
            let was_idle = deployer.phase() == DeployPhase::Idle;
            deployer.observe_update(&target_ref);
            if was_idle {
                self.notifier.notify(
                    EventKind::UpdateDetected,
                    &format!("new commit {target_ref} on tracked branch, restart pending"),
                );
            }
        }

        for event in self.manager.take_escalations().await {
            let code = event
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            if event.optional {
                // Contained: the fleet keeps going without it
                self.notifier.notify(
                    EventKind::Escalation,
                    &format!(
                        "optional process '{}' gave up (exit {code}), leaving it down",
                        event.name
                    ),
                );
            } else {
                self.deployer
                    .lock()
                    .await
                    .request(RestartRequest::process(&event.name));
                self.notifier.notify(
                    EventKind::Escalation,
                    &format!(
                        "process '{}' beyond local recovery (exit {code}), supervisor restart requested",
                        event.name
                    ),
                );
            }
        }

        let active = self.sessions.active_count();
        let (fired, target) = {
            let mut deployer = self.deployer.lock().await;
            let fired = deployer.tick(active);
            (fired, deployer.target_ref().map(str::to_string))
        };
        if let Some(req) = fired {
            // Sync the work tree before signaling, so the relaunch runs the
            // new code even if the fetch window has moved on
            if req.kind == RestartKind::Update
                && let Some(ref target_ref) = target
                && let Err(e) = self.poller.lock().await.repo().sync_to(target_ref).await
            {
                warn!(error = %e, "failed to sync work tree before restart");
            }
            self.notifier.notify(
                EventKind::Restarting,
                &format!("restarting supervisor (reason: {:?})", req.kind),
            );
            return Some(req.kind.exit_code());
        }
        None
    }

    async fn snapshot(&self) -> StatusSnapshot {
        let deployer = self.deployer.lock().await;
        StatusSnapshot {
            processes: self.manager.status_all().await,
            phase: deployer.phase(),
            pending: deployer.pending_kind(),
            target_ref: deployer.target_ref().map(str::to_string),
        }
    }

    async fn handle_request(&self, req: Request) -> Response {
        match req {
            Request::Status => Response::Status {
                snapshot: self.snapshot().await,
            },
            Request::Start { name } => match self.manager.start(&name).await {
                Ok(()) => success(format!("'{name}' started")),
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Stop { name } => match self.manager.stop(&name).await {
                Ok(true) => success(format!("'{name}' stopped")),
                Ok(false) => success(format!("'{name}' was not running")),
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Restart { name } => match self.manager.restart(&name).await {
                Ok(()) => success(format!("'{name}' restarted")),
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Update { force } => self.handle_update(force).await,
            Request::Cancel => match self.deployer.lock().await.cancel() {
                Ok(req) => success(format!("pending {:?} restart cancelled", req.kind)),
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Kill => {
                let _ = self.exit_tx.send(0).await;
                success("supervisor shutting down".to_string())
            }
        }
    }

    async fn handle_update(&self, force: bool) -> Response {
        if force {
            let accepted = self
                .deployer
                .lock()
                .await
                .request(RestartRequest::manual());
            return if accepted {
                success("forced restart scheduled, ignoring active sessions".to_string())
            } else {
                Response::Error {
                    message: "restart already in progress".to_string(),
                }
            };
        }

        // Poll immediately instead of waiting for the next interval
        let outcome = self.poller.lock().await.poll().await;
        match outcome {
            PollOutcome::UpdateAvailable { target_ref } => {
                let mut deployer = self.deployer.lock().await;
                deployer.observe_update(&target_ref);
                success(format!("update to {target_ref} scheduled"))
            }
            PollOutcome::NoUpdate => {
                let deployer = self.deployer.lock().await;
                if deployer.pending_kind() == Some(RestartKind::Update) {
                    success("update restart already pending".to_string())
                } else {
                    success("already up to date".to_string())
                }
            }
        }
    }
}

fn success(message: String) -> Response {
    Response::Success {
        message: Some(message),
    }
}

/// One connection, newline-delimited JSON requests until EOF.
async fn handle_client(shared: Arc<Shared>, stream: sys::IpcStream) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "control connection read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match protocol::decode_request(&line) {
            Ok(req) => shared.handle_request(req).await,
            Err(e) => Response::Error {
                message: format!("bad request: {e}"),
            },
        };

        let bytes = match protocol::encode_response(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode response");
                return;
            }
        };
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
