use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Record the watchdog carries across supervisor restarts. Single writer:
/// only the watchdog loop touches the file, once after every exit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchdogState {
    pub last_known_good_commit: Option<String>,
    pub consecutive_fast_crashes: u32,
    pub last_start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to write state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize state: {0}")]
    Json(#[from] serde_json::Error),
}

/// load()/save() repository for the persisted state, with atomic
/// write-then-rename so a crash mid-write never corrupts a valid file.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// An unreadable or malformed file means "no known-good commit", not a
    /// crash: the watchdog starts from a clean slate.
    pub fn load(&self) -> WatchdogState {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(_) => return WatchdogState::default(),
        };
        match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file corrupt, starting fresh");
                WatchdogState::default()
            }
        }
    }

    pub fn save(&self, state: &WatchdogState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
