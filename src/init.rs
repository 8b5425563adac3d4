use color_eyre::eyre::bail;
use std::path::Path;

const TEMPLATE: &str = r#"# warden.toml — supervisor and process fleet configuration

[supervisor]
repo_dir = "."
remote = "origin"
branch = "main"
poll_interval = 60          # git poll cadence, seconds
tick_interval = 2           # core loop tick, seconds
sessions_dir = "sessions"   # one marker file per live session
stability_threshold = 60    # seconds; shorter runs count as fast crashes
# install_command = "npm ci"
# recovery_command = "scripts/diagnose.sh"
# notify_command = "scripts/notify.sh"

[processes.app]
command = "node dist/app.js"
# cwd = "."
# env = { NODE_ENV = "production" }
# depends_on = []
# optional = false
# max_restarts = 15
# min_uptime = 1000           # ms
# kill_timeout = 5000         # ms
# kill_signal = "SIGTERM"
# start_grace = 2000          # ms

# [processes.app.exit_codes]
# 50 = "stop"
# 51 = "escalate"
"#;

/// Write a starter warden.toml into `dir`. Refuses to clobber an existing
/// file.
pub fn run(dir: &Path) -> color_eyre::Result<()> {
    let path = dir.join("warden.toml");
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    std::fs::write(&path, TEMPLATE)?;
    println!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_is_valid_config() {
        let config = crate::config::parse_config(TEMPLATE).unwrap();
        assert_eq!(config.supervisor.branch, "main");
        assert!(config.processes.contains_key("app"));
    }

    #[test]
    fn test_writes_file_once() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path()).unwrap();
        assert!(dir.path().join("warden.toml").exists());
        // Second run refuses to overwrite
        assert!(run(dir.path()).is_err());
    }
}
