use crate::sys;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    UpdateDetected,
    Restarting,
    Rollback,
    Escalation,
    Recovery,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::UpdateDetected => write!(f, "update_detected"),
            EventKind::Restarting => write!(f, "restarting"),
            EventKind::Rollback => write!(f, "rollback"),
            EventKind::Escalation => write!(f, "escalation"),
            EventKind::Recovery => write!(f, "recovery"),
        }
    }
}

/// Human-visible alert sink. Always logs; optionally fans out to a
/// configured shell command with the kind and message as arguments.
#[derive(Clone)]
pub struct Notifier {
    command: Option<String>,
}

impl Notifier {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    pub fn notify(&self, kind: EventKind, message: &str) {
        info!(event = %kind, message, "notification");

        if let Some(ref hook) = self.command {
            // Fire and forget; a broken sink must never stall the loop
            let mut cmd = sys::hook_command(hook);
            cmd.arg(kind.to_string())
                .arg(message)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            let _ = cmd.spawn();
        }
    }
}
