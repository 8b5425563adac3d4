use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Phase of the update state machine. At most one cycle is ever active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Idle,
    UpdateDetected,
    WaitingForQuiescence,
    Restarting,
}

impl std::fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployPhase::Idle => write!(f, "idle"),
            DeployPhase::UpdateDetected => write!(f, "update detected"),
            DeployPhase::WaitingForQuiescence => write!(f, "waiting for quiescence"),
            DeployPhase::Restarting => write!(f, "restarting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartKind {
    /// A single child asked for parent attention (supervisor exit 43).
    Process,
    /// New commits on the tracked remote ref (supervisor exit 42).
    Update,
    /// Operator force-restart; pre-empts the quiescence wait (exit 44).
    Manual,
}

impl RestartKind {
    fn priority(self) -> u8 {
        match self {
            RestartKind::Process => 0,
            RestartKind::Update => 1,
            RestartKind::Manual => 2,
        }
    }

    /// Exit code the supervisor terminates with, consumed by the watchdog.
    pub fn exit_code(self) -> i32 {
        match self {
            RestartKind::Update => 42,
            RestartKind::Process => 43,
            RestartKind::Manual => 44,
        }
    }
}

/// Value in the single pending-restart slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartRequest {
    pub kind: RestartKind,
    pub requested_at: DateTime<Utc>,
    /// Process name for Process-kind requests; None = whole supervisor.
    pub target: Option<String>,
}

impl RestartRequest {
    pub fn update() -> Self {
        Self {
            kind: RestartKind::Update,
            requested_at: Utc::now(),
            target: None,
        }
    }

    pub fn manual() -> Self {
        Self {
            kind: RestartKind::Manual,
            requested_at: Utc::now(),
            target: None,
        }
    }

    pub fn process(name: &str) -> Self {
        Self {
            kind: RestartKind::Process,
            requested_at: Utc::now(),
            target: Some(name.to_string()),
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum CancelError {
    #[error("no restart is pending")]
    NothingPending,
    #[error("restart already in progress, too late to cancel")]
    TooLate,
}

/// Decides when a coordinated restart happens: waits for zero active
/// sessions after an update, gated each tick, with a manual force request
/// as the only override. Pure state; no IO.
pub struct Deployer {
    phase: DeployPhase,
    pending: Option<RestartRequest>,
    target_ref: Option<String>,
    detected_at: Option<DateTime<Utc>>,
}

impl Deployer {
    pub fn new() -> Self {
        Self {
            phase: DeployPhase::Idle,
            pending: None,
            target_ref: None,
            detected_at: None,
        }
    }

    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    pub fn pending_kind(&self) -> Option<RestartKind> {
        self.pending.as_ref().map(|r| r.kind)
    }

    pub fn target_ref(&self) -> Option<&str> {
        self.target_ref.as_deref()
    }

    /// Feed an UpdateAvailable report from the poller.
    pub fn observe_update(&mut self, target_ref: &str) {
        match self.phase {
            DeployPhase::Idle => {
                info!(target_ref, "update detected");
                self.phase = DeployPhase::UpdateDetected;
                self.target_ref = Some(target_ref.to_string());
                self.detected_at = Some(Utc::now());
                self.accept(RestartRequest::update());
            }
            DeployPhase::UpdateDetected | DeployPhase::WaitingForQuiescence => {
                // Already in progress; only a genuinely newer ref matters
                if self.pending_kind() == Some(RestartKind::Update)
                    && self.target_ref.as_deref() != Some(target_ref)
                {
                    info!(target_ref, "update target moved while waiting");
                    self.target_ref = Some(target_ref.to_string());
                }
            }
            DeployPhase::Restarting => {}
        }
    }

    /// Compare-and-set on the single pending slot: equal-or-lower priority
    /// is coalesced into the existing request, higher priority replaces it.
    /// Returns whether the request took the slot.
    pub fn request(&mut self, req: RestartRequest) -> bool {
        if self.phase == DeployPhase::Restarting {
            return false;
        }
        let accepted = self.accept(req);
        if accepted && self.phase == DeployPhase::Idle {
            self.phase = DeployPhase::WaitingForQuiescence;
        }
        accepted
    }

    fn accept(&mut self, req: RestartRequest) -> bool {
        match &self.pending {
            Some(existing) if existing.kind.priority() >= req.kind.priority() => false,
            _ => {
                self.pending = Some(req);
                true
            }
        }
    }

    /// Valid only before the restart signal has been issued.
    pub fn cancel(&mut self) -> Result<RestartRequest, CancelError> {
        match self.phase {
            DeployPhase::UpdateDetected | DeployPhase::WaitingForQuiescence => {
                let req = self.pending.take().ok_or(CancelError::NothingPending)?;
                info!(kind = ?req.kind, "pending restart cancelled");
                self.phase = DeployPhase::Idle;
                self.target_ref = None;
                self.detected_at = None;
                Ok(req)
            }
            DeployPhase::Restarting => Err(CancelError::TooLate),
            DeployPhase::Idle => Err(CancelError::NothingPending),
        }
    }

    /// One poll tick. Returns the request to execute once it is safe:
    /// sessions have drained, or a manual force overrides the wait.
    pub fn tick(&mut self, active_sessions: usize) -> Option<RestartRequest> {
        if self.phase == DeployPhase::UpdateDetected {
            self.phase = DeployPhase::WaitingForQuiescence;
        }
        if self.phase != DeployPhase::WaitingForQuiescence {
            return None;
        }
        let kind = self.pending_kind()?;

        if active_sessions > 0 {
            if kind != RestartKind::Manual {
                return None;
            }
            // Explicit operator override, best-effort observability
            warn!(active_sessions, "manual restart overriding active sessions");
        }

        self.phase = DeployPhase::Restarting;
        self.pending.take()
    }

    /// Restart signal issued; the cycle is over.
    pub fn complete(&mut self) {
        self.phase = DeployPhase::Idle;
        self.target_ref = None;
        self.detected_at = None;
    }
}

impl Default for Deployer {
    fn default() -> Self {
        Self::new()
    }
}
