use crate::config::ProcessConfig;
use crate::deps::{self, DepsError};
use crate::paths::Paths;
use crate::process::{
    self, DEFAULT_START_GRACE_MS, Escalation, EscalationSender, ProcessError, ProcessTable,
};
use crate::protocol::{ProcessReport, ProcessStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};

const START_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Margin on top of a process's start grace before giving up on it.
const START_WAIT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),
    #[error("dependency '{dep}' of '{name}' is not running")]
    DependencyNotReady { name: String, dep: String },
    #[error("process '{name}' exited during startup (exit code {code:?})")]
    StartFailed { name: String, code: Option<i32> },
    #[error("timeout waiting for '{0}' to come up")]
    StartTimeout(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Deps(#[from] DepsError),
}

/// Owns the lifecycle of the configured child fleet. Status reads never
/// block on lifecycle operations for other processes; operations on the
/// same name are serialized through a per-name lock.
pub struct ProcessManager {
    configs: HashMap<String, ProcessConfig>,
    paths: Paths,
    processes: Arc<RwLock<ProcessTable>>,
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    escalation_tx: EscalationSender,
    escalation_rx: Mutex<mpsc::UnboundedReceiver<Escalation>>,
}

impl ProcessManager {
    pub fn new(configs: HashMap<String, ProcessConfig>, paths: Paths) -> Result<Self, ManagerError> {
        deps::validate(&configs)?;
        // Fail early on an undetectable start order
        deps::start_levels(&configs)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            configs,
            paths,
            processes: Arc::new(RwLock::new(HashMap::new())),
            name_locks: Mutex::new(HashMap::new()),
            escalation_tx: tx,
            escalation_rx: Mutex::new(rx),
        };
        Ok(manager)
    }

    pub fn configs(&self) -> &HashMap<String, ProcessConfig> {
        &self.configs
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Start one process and wait until it is running. Declared
    /// dependencies must already be running; a dependency still inside its
    /// own start grace is waited on, anything else is DependencyNotReady.
    pub async fn start(&self, name: &str) -> Result<(), ManagerError> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;
        self.start_locked(name).await?;
        self.wait_started(name).await
    }

    async fn start_locked(&self, name: &str) -> Result<(), ManagerError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?
            .clone();

        {
            let table = self.processes.read().await;
            if let Some(existing) = table.get(name) {
                match existing.status {
                    ProcessStatus::Running | ProcessStatus::Starting => {
                        return Err(ManagerError::AlreadyRunning(name.to_string()));
                    }
                    _ => {}
                }
            }
        }

        for dep in config.depends_on.as_deref().unwrap_or(&[]) {
            let dep_status = {
                let table = self.processes.read().await;
                table.get(dep).map(|m| m.status)
            };
            match dep_status {
                Some(ProcessStatus::Running) => {}
                Some(ProcessStatus::Starting) => {
                    // Still inside its grace window — give it the chance
                    self.wait_started(dep).await.map_err(|_| {
                        ManagerError::DependencyNotReady {
                            name: name.to_string(),
                            dep: dep.clone(),
                        }
                    })?;
                }
                _ => {
                    return Err(ManagerError::DependencyNotReady {
                        name: name.to_string(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        let old_restarts = {
            let table = self.processes.read().await;
            table.get(name).map(|m| m.restarts)
        };

        let (mut managed, child) = process::spawn_process(name.to_string(), config, &self.paths).await?;
        if let Some(previous) = old_restarts {
            managed.restarts = previous;
        }
        let pid = managed.pid;
        info!(name, ?pid, "process starting");

        {
            let mut table = self.processes.write().await;
            table.insert(name.to_string(), managed);
        }

        process::spawn_monitor(
            name.to_string(),
            child,
            pid,
            Arc::clone(&self.processes),
            self.paths.clone(),
            self.escalation_tx.clone(),
        );

        Ok(())
    }

    /// Poll until the process passes its start grace (running) or dies.
    async fn wait_started(&self, name: &str) -> Result<(), ManagerError> {
        let grace_ms = self
            .configs
            .get(name)
            .and_then(|c| c.start_grace)
            .unwrap_or(DEFAULT_START_GRACE_MS);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(grace_ms) + START_WAIT_MARGIN;

        loop {
            let (status, code) = {
                let table = self.processes.read().await;
                match table.get(name) {
                    Some(m) => (m.status, m.last_exit_code),
                    None => return Err(ManagerError::NotFound(name.to_string())),
                }
            };
            match status {
                ProcessStatus::Running => return Ok(()),
                ProcessStatus::Crashed | ProcessStatus::Stopped => {
                    return Err(ManagerError::StartFailed {
                        name: name.to_string(),
                        code,
                    });
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ManagerError::StartTimeout(name.to_string()));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    /// Graceful stop. Returns false when the process was already stopped
    /// (a no-op, not an error).
    pub async fn stop(&self, name: &str) -> Result<bool, ManagerError> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> Result<bool, ManagerError> {
        if !self.configs.contains_key(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }

        let (pid, config) = {
            let mut table = self.processes.write().await;
            let Some(managed) = table.get_mut(name) else {
                return Ok(false);
            };
            match managed.status {
                ProcessStatus::Stopped | ProcessStatus::Crashed | ProcessStatus::NotStarted => {
                    return Ok(false);
                }
                _ => {}
            }
            // Flag the monitor before signaling so it never auto-restarts.
            // send_replace updates the value even with no live receiver.
            if let Some(ref tx) = managed.monitor_shutdown {
                tx.send_replace(true);
            }
            let Some(pid) = managed.pid else {
                managed.status = ProcessStatus::Stopped;
                return Ok(true);
            };
            managed.status = ProcessStatus::Stopping;
            (pid, managed.config.clone())
        };

        // Signal and wait without holding the table
        process::stop_group(name, pid, &config).await?;

        let mut table = self.processes.write().await;
        if let Some(managed) = table.get_mut(name)
            && managed.pid == Some(pid)
        {
            managed.pid = None;
            managed.status = ProcessStatus::Stopped;
        }
        info!(name, "process stopped");
        Ok(true)
    }

    /// Stop-then-start, atomic with respect to other lifecycle calls for
    /// the same name.
    pub async fn restart(&self, name: &str) -> Result<(), ManagerError> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        self.stop_locked(name).await?;
        {
            let mut table = self.processes.write().await;
            if let Some(managed) = table.get_mut(name) {
                managed.restarts += 1;
            }
        }
        self.start_locked(name).await?;
        self.wait_started(name).await
    }

    // -------------------------------------------------------------------
    // Fleet operations
    // -------------------------------------------------------------------

    /// Start every configured process in dependency levels; a level must be
    /// fully running before its dependents launch. Optional processes that
    /// fail to come up are logged and skipped instead of failing the fleet.
    pub async fn start_all(&self) -> Result<(), ManagerError> {
        let levels = deps::start_levels(&self.configs)?;

        for level in levels {
            for name in &level {
                let optional = self.configs[name].optional;
                match self.start_locked(name).await {
                    Ok(()) => {}
                    Err(ManagerError::AlreadyRunning(_)) => {}
                    Err(e) if optional => {
                        warn!(name, error = %e, "optional process failed to start");
                    }
                    Err(e) => return Err(e),
                }
            }
            for name in &level {
                let optional = self.configs[name].optional;
                match self.wait_started(name).await {
                    Ok(()) => {}
                    Err(e) if optional => {
                        warn!(name, error = %e, "optional process not running");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Stop everything in reverse dependency order: dependents go down
    /// before the processes they rely on.
    pub async fn stop_all(&self) {
        let order = match deps::stop_order(&self.configs) {
            Ok(order) => order,
            Err(_) => self.configs.keys().cloned().collect(),
        };
        for name in &order {
            if let Err(e) = self.stop(name).await {
                warn!(name, error = %e, "failed to stop process during shutdown");
            }
        }
    }

    // -------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------

    pub async fn status(&self, name: &str) -> Option<ProcessReport> {
        let table = self.processes.read().await;
        match table.get(name) {
            Some(managed) => Some(managed.to_report()),
            None => self.configs.get(name).map(|c| not_started_report(name, c)),
        }
    }

    /// Snapshot of every configured process, sorted by name. Never blocks
    /// on lifecycle operations.
    pub async fn status_all(&self) -> Vec<ProcessReport> {
        let table = self.processes.read().await;
        let mut reports: Vec<ProcessReport> = self
            .configs
            .iter()
            .map(|(name, config)| match table.get(name) {
                Some(managed) => managed.to_report(),
                None => not_started_report(name, config),
            })
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Drain escalations queued by the monitors since the last tick.
    pub async fn take_escalations(&self) -> Vec<Escalation> {
        let mut rx = self.escalation_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

fn not_started_report(name: &str, config: &ProcessConfig) -> ProcessReport {
    ProcessReport {
        name: name.to_string(),
        pid: None,
        status: ProcessStatus::NotStarted,
        uptime: None,
        restarts: 0,
        last_exit_code: None,
        optional: config.optional,
    }
}
