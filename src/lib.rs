//! Self-updating process supervisor: a watchdog relaunches the supervisor,
//! the supervisor runs a process fleet, polls git for new commits, and
//! restarts itself at session boundaries with exit codes the watchdog
//! interprets.

pub mod cli;
pub mod client;
pub mod config;
pub mod deploy;
pub mod deps;
pub mod git;
pub mod init;
pub mod manager;
pub mod notify;
pub mod paths;
pub mod pid;
pub mod process;
pub mod protocol;
pub mod sessions;
pub mod state;
pub mod supervisor;
pub mod sys;
pub mod watchdog;
