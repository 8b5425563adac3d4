use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "warden", about = "A self-updating process supervisor", version)]
pub struct Cli {
    /// Run the supervisor core loop in the foreground (launched by the
    /// watchdog, not by hand).
    #[arg(long, hide = true)]
    pub supervisor: bool,

    /// Path to warden.toml (default: ./warden.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the watchdog: launch and keep relaunching the supervisor
    Watchdog,
    /// Show the status of all managed processes and the deploy phase
    Status,
    /// Start one managed process
    Start { name: String },
    /// Stop one managed process
    Stop { name: String },
    /// Restart one managed process
    Restart { name: String },
    /// Check for updates and schedule a coordinated restart
    Update {
        /// Restart now, ignoring active sessions
        #[arg(long)]
        force: bool,
    },
    /// Cancel a pending restart
    Cancel,
    /// Stop all processes and shut down the supervisor
    Kill,
    /// Initialize a new warden.toml configuration file
    Init,
}
