use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use warden::cli::{Cli, Command};
use warden::config::{self, Config};
use warden::protocol::{ProcessStatus, Request, Response, StatusSnapshot};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("warden.toml"));

    if cli.supervisor {
        init_tracing();
        let config = load(&config_path)?;
        let paths = warden::paths::Paths::new()?;
        let code = warden::supervisor::Supervisor::new(config, paths)?
            .run()
            .await?;
        std::process::exit(code);
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Watchdog => {
            init_tracing();
            let config = load(&config_path)?;
            let paths = warden::paths::Paths::new()?;
            let watchdog = warden::watchdog::Watchdog::new(&config, config_path, &paths);
            let code = watchdog.run().await?;
            std::process::exit(code);
        }
        Command::Init => {
            let cwd = std::env::current_dir()?;
            warden::init::run(&cwd)?;
        }
        command => {
            let paths = warden::paths::Paths::new()?;
            let request = command_to_request(command);
            let response = warden::client::send_request(&paths, &request)?;
            if cli.json {
                print_response_json(&response);
            } else {
                print_response(&response);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load(path: &std::path::Path) -> color_eyre::Result<Config> {
    config::load_config(path).map_err(|e| color_eyre::eyre::eyre!("{e}"))
}

fn command_to_request(command: Command) -> Request {
    match command {
        Command::Status => Request::Status,
        Command::Start { name } => Request::Start { name },
        Command::Stop { name } => Request::Stop { name },
        Command::Restart { name } => Request::Restart { name },
        Command::Update { force } => Request::Update { force },
        Command::Cancel => Request::Cancel,
        Command::Kill => Request::Kill,
        Command::Watchdog | Command::Init => unreachable!("handled directly in main"),
    }
}

fn print_response_json(response: &Response) {
    match serde_json::to_string(response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize response: {e}"),
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            if let Some(msg) = message {
                println!("{}", msg.green());
            } else {
                println!("{}", "ok".green());
            }
        }
        Response::Error { message } => {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        Response::Status { snapshot } => print_snapshot(snapshot),
    }
}

fn status_color(status: &ProcessStatus) -> Color {
    match status {
        ProcessStatus::Running => Color::Green,
        ProcessStatus::Starting | ProcessStatus::Stopping => Color::Yellow,
        ProcessStatus::NotStarted | ProcessStatus::Stopped => Color::Reset,
        ProcessStatus::Crashed => Color::Red,
    }
}

fn print_snapshot(snapshot: &StatusSnapshot) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("restarts").add_attribute(Attribute::Bold),
        Cell::new("last exit").add_attribute(Attribute::Bold),
    ]);

    for p in &snapshot.processes {
        let pid = p
            .pid
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = p.uptime.map(format_uptime).unwrap_or_else(|| "-".to_string());
        let last_exit = p
            .last_exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let restarts = p.restarts.to_string();
        let restarts_cell = if p.restarts > 0 {
            Cell::new(&restarts).fg(Color::Yellow)
        } else {
            Cell::new(&restarts)
        };
        let name = if p.optional {
            format!("{} (optional)", p.name)
        } else {
            p.name.clone()
        };
        table.add_row(vec![
            Cell::new(name).fg(Color::Cyan),
            Cell::new(&pid),
            Cell::new(p.status.to_string()).fg(status_color(&p.status)),
            Cell::new(&uptime),
            restarts_cell,
            Cell::new(&last_exit),
        ]);
    }
    println!("{table}");

    println!("{} {}", "deploy phase:".dimmed(), snapshot.phase);
    if let Some(kind) = snapshot.pending {
        println!("{} {kind:?}", "pending restart:".dimmed());
    }
    if let Some(ref target) = snapshot.target_ref {
        println!("{} {target}", "target ref:".dimmed());
    }
}

fn format_uptime(secs: u64) -> String {
    if secs >= 86_400 {
        format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600)
    } else if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
