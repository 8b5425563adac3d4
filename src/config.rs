use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// What to do when a child exits with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    /// Restart immediately, no delay.
    Restart,
    /// Restart after exponential backoff.
    Backoff,
    /// Leave the process stopped permanently.
    Stop,
    /// Surface to the supervisor loop as a restart request.
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_repo_dir")]
    pub repo_dir: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Git poll cadence, seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Core loop tick, seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,
    /// Directory of live-session marker files, relative to repo_dir.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    /// Seconds; a supervisor run shorter than this counts as a fast crash.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u64,
    /// Run after an update exit, before relaunch (e.g. "npm ci").
    pub install_command: Option<String>,
    /// Diagnostic agent launched in emergency-recovery mode.
    pub recovery_command: Option<String>,
    /// Shell sink for (event_kind, message) notifications.
    pub notify_command: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            remote: default_remote(),
            branch: default_branch(),
            poll_interval: default_poll_interval(),
            tick_interval: default_tick_interval(),
            sessions_dir: default_sessions_dir(),
            stability_threshold: default_stability_threshold(),
            install_command: None,
            recovery_command: None,
            notify_command: None,
        }
    }
}

fn default_repo_dir() -> String {
    ".".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_tick_interval() -> u64 {
    2
}

fn default_sessions_dir() -> String {
    "sessions".to_string()
}

fn default_stability_threshold() -> u64 {
    60
}

/// Immutable description of one managed child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub command: String,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub depends_on: Option<Vec<String>>,
    /// Failure to start or stay up is non-fatal to the fleet.
    #[serde(default)]
    pub optional: bool,
    pub max_restarts: Option<u32>,
    /// Milliseconds a run must last to reset the crash counter.
    pub min_uptime: Option<u64>,
    /// Milliseconds to wait for graceful exit before killing the group.
    pub kill_timeout: Option<u64>,
    pub kill_signal: Option<String>,
    /// Milliseconds a child must survive before it counts as running.
    pub start_grace: Option<u64>,
    /// Exit-code policy: code -> action. Unlisted: 0 stops, nonzero backs off.
    #[serde(default, deserialize_with = "de_exit_codes")]
    pub exit_codes: HashMap<i32, ExitAction>,
}

impl ProcessConfig {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            cwd: None,
            env: None,
            depends_on: None,
            optional: false,
            max_restarts: None,
            min_uptime: None,
            kill_timeout: None,
            kill_signal: None,
            start_grace: None,
            exit_codes: HashMap::new(),
        }
    }
}

// TOML table keys are always strings; exit codes are integers.
fn de_exit_codes<'de, D>(deserializer: D) -> Result<HashMap<i32, ExitAction>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let raw: HashMap<String, ExitAction> = HashMap::deserialize(deserializer)?;
    let mut codes = HashMap::with_capacity(raw.len());
    for (key, action) in raw {
        let code: i32 = key
            .parse()
            .map_err(|_| D::Error::custom(format!("exit code is not an integer: '{key}'")))?;
        codes.insert(code, action);
    }
    Ok(codes)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub processes: HashMap<String, ProcessConfig>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("no processes configured")]
    NoProcesses,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("{0}")]
    IoError(String),
}

pub fn load_config(path: &std::path::Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let config: Config =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    if config.processes.is_empty() {
        return Err(ConfigError::NoProcesses);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let input = r#"
[supervisor]
repo_dir = "/srv/bot"
remote = "origin"
branch = "main"
poll_interval = 30
tick_interval = 1
sessions_dir = "run/sessions"
stability_threshold = 60
install_command = "npm ci"
recovery_command = "scripts/diagnose.sh"
notify_command = "scripts/notify.sh"

[processes.bot]
command = "node dist/bot.js"
cwd = "/srv/bot"
env = { SLACK_MODE = "socket" }
depends_on = ["mcp"]
optional = false
max_restarts = 10
min_uptime = 1000
kill_timeout = 5000
kill_signal = "SIGTERM"
start_grace = 2000

[processes.bot.exit_codes]
42 = "restart"
50 = "stop"
51 = "escalate"

[processes.mcp]
command = "node dist/mcp.js"
optional = true
"#;
        let config = parse_config(input).unwrap();
        assert_eq!(config.supervisor.repo_dir, "/srv/bot");
        assert_eq!(config.supervisor.poll_interval, 30);
        assert_eq!(config.supervisor.install_command.as_deref(), Some("npm ci"));

        let bot = &config.processes["bot"];
        assert_eq!(bot.command, "node dist/bot.js");
        assert_eq!(bot.depends_on, Some(vec!["mcp".to_string()]));
        assert!(!bot.optional);
        assert_eq!(bot.max_restarts, Some(10));
        assert_eq!(bot.start_grace, Some(2000));
        assert_eq!(bot.exit_codes.get(&42), Some(&ExitAction::Restart));
        assert_eq!(bot.exit_codes.get(&50), Some(&ExitAction::Stop));
        assert_eq!(bot.exit_codes.get(&51), Some(&ExitAction::Escalate));

        assert!(config.processes["mcp"].optional);
    }

    #[test]
    fn test_supervisor_section_defaults() {
        let input = r#"
[processes.bot]
command = "node bot.js"
"#;
        let config = parse_config(input).unwrap();
        assert_eq!(config.supervisor.repo_dir, ".");
        assert_eq!(config.supervisor.remote, "origin");
        assert_eq!(config.supervisor.branch, "main");
        assert_eq!(config.supervisor.poll_interval, 60);
        assert_eq!(config.supervisor.stability_threshold, 60);
        assert!(config.supervisor.install_command.is_none());
    }

    #[test]
    fn test_missing_command_errors() {
        let input = r#"
[processes.bot]
cwd = "/srv/bot"
"#;
        let result = parse_config(input);
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_unknown_field_errors() {
        let input = r#"
[processes.bot]
command = "node bot.js"
bogus_field = "x"
"#;
        let result = parse_config(input);
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_empty_file_errors() {
        assert_eq!(parse_config("").unwrap_err(), ConfigError::Empty);
        assert_eq!(parse_config("  \n").unwrap_err(), ConfigError::Empty);
    }

    #[test]
    fn test_no_processes_errors() {
        let input = r#"
[supervisor]
branch = "main"
"#;
        assert_eq!(parse_config(input).unwrap_err(), ConfigError::NoProcesses);
    }

    #[test]
    fn test_bad_exit_code_key_errors() {
        let input = r#"
[processes.bot]
command = "node bot.js"

[processes.bot.exit_codes]
notanumber = "restart"
"#;
        let result = parse_config(input);
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_optional_fields_default() {
        let input = r#"
[processes.api]
command = "cargo run"
"#;
        let config = parse_config(input).unwrap();
        let api = &config.processes["api"];
        assert!(api.cwd.is_none());
        assert!(api.env.is_none());
        assert!(api.depends_on.is_none());
        assert!(!api.optional);
        assert!(api.max_restarts.is_none());
        assert!(api.min_uptime.is_none());
        assert!(api.kill_timeout.is_none());
        assert!(api.kill_signal.is_none());
        assert!(api.start_grace.is_none());
        assert!(api.exit_codes.is_empty());
    }
}
