mod commands;
mod errors;

use std::path::PathBuf;
use std::time::Duration;

use berth_daemon::Daemon;
use berth_protocol::client::Client;
use berth_protocol::protocol::{
    ErrorKind, OperationSnapshot, OperationState, Outcome, OutcomeCounters, Response, ResponseData,
    RunState,
};
use clap::Parser;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

use crate::commands::{Commands, DaemonCommands, GroupCommands};
use crate::errors::{CliError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(300);
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Berth - manage sandboxed development containers
#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Daemon commands do not need a running daemon.
    if let Commands::Daemon { command } = &cli.command {
        return handle_daemon_command(command).await;
    }

    let socket_path = Daemon::socket_path().map_err(|e| CliError::Daemon(e.to_string()))?;
    let client = match Client::connect(&socket_path).await {
        Ok(c) => c,
        Err(berth_protocol::errors::ClientError::Connect(_)) => {
            eprintln!("Daemon is not running. Start it with: berth daemon start -d");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    match cli.command {
        Commands::Start { name, detach } => track(&client, client.start(name).await?, detach).await,
        Commands::Stop { name, detach } => track(&client, client.stop(name).await?, detach).await,
        Commands::Restart { name, detach } => {
            track(&client, client.restart(name).await?, detach).await
        }
        Commands::Cleanup { name, detach } => {
            track(&client, client.cleanup(name).await?, detach).await
        }
        Commands::Group { command } => match command {
            GroupCommands::Start { group, detach } => {
                track(&client, client.group_start(group).await?, detach).await
            }
            GroupCommands::Stop { group, detach } => {
                track(&client, client.group_stop(group).await?, detach).await
            }
            GroupCommands::Status { group } => handle_group_status(&client, &group).await,
        },
        Commands::StopAll { detach } => track(&client, client.stop_all().await?, detach).await,
        Commands::RestartAll { detach } => {
            track(&client, client.restart_all().await?, detach).await
        }
        Commands::CleanupAll { detach } => {
            track(&client, client.cleanup_all().await?, detach).await
        }
        Commands::Ps => handle_ps(&client).await,
        Commands::Status { operation_id } => handle_status(&client, &operation_id).await,
        Commands::Cancel { operation_id } => {
            let response = client.cancel_operation(operation_id).await?;
            print_plain_response(response);
            Ok(())
        }
        Commands::Daemon { .. } => unreachable!("daemon commands handled above"),
    }
}

/// Follow a freshly submitted operation until it settles (or just print the
/// id when detached).
async fn track(client: &Client, response: Response, detach: bool) -> Result<()> {
    let operation_id = match response {
        Response::Ok {
            data: Some(ResponseData::Accepted { operation_id }),
            ..
        } => operation_id,
        Response::Ok { message, .. } => {
            if let Some(msg) = message {
                println!("{}", msg);
            }
            return Ok(());
        }
        Response::Error { kind, message } => return Err(daemon_error(kind, message)),
    };

    if detach {
        println!("{}", operation_id);
        return Ok(());
    }

    let snapshot = poll_until_settled(client, &operation_id).await?;
    print_summary(&snapshot);
    if snapshot.state == OperationState::Error || snapshot.counters.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn poll_until_settled(client: &Client, operation_id: &str) -> Result<OperationSnapshot> {
    loop {
        match client.operation_status(operation_id).await? {
            Response::Ok {
                data: Some(ResponseData::Operation(snapshot)),
                ..
            } => {
                if snapshot.state.is_terminal() {
                    return Ok(snapshot);
                }
            }
            Response::Error { kind, message } => return Err(daemon_error(kind, message)),
            other => {
                return Err(CliError::Daemon(format!(
                    "unexpected response: {:?}",
                    other
                )));
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_summary(snapshot: &OperationSnapshot) {
    let line = summary_line(&snapshot.counters);
    match snapshot.state {
        OperationState::Completed if snapshot.counters.failed == 0 => {
            println!("{} {}", "ok".green().bold(), line);
        }
        OperationState::Completed => {
            println!("{} {}", "partial".yellow().bold(), line);
        }
        _ => {
            println!("{} {}", "error".red().bold(), line);
        }
    }
    for error in &snapshot.errors {
        eprintln!("  {}", error.red());
    }
}

/// Human-readable counter summary, non-zero buckets only.
fn summary_line(counters: &OutcomeCounters) -> String {
    let buckets = [
        (counters.started, "started"),
        (counters.already_running, "already running"),
        (counters.stopped, "stopped"),
        (counters.not_running, "not running"),
        (counters.restarted, "restarted"),
        (counters.removed, "removed"),
        (counters.failed, "failed"),
    ];
    let parts: Vec<String> = buckets
        .iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{} {}", count, label))
        .collect();
    if parts.is_empty() {
        "nothing to do".to_string()
    } else {
        parts.join(", ")
    }
}

#[derive(Tabled)]
struct MemberRow {
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
}

fn colored_state(state: RunState) -> String {
    match state {
        RunState::Running => "running".green().to_string(),
        RunState::Exited => "exited".yellow().to_string(),
        RunState::Absent => "absent".dimmed().to_string(),
    }
}

async fn handle_ps(client: &Client) -> Result<()> {
    match client.list_managed().await? {
        Response::Ok {
            data: Some(ResponseData::Managed(members)),
            ..
        } => {
            if members.is_empty() {
                println!("No managed containers");
                return Ok(());
            }
            let rows: Vec<MemberRow> = members
                .into_iter()
                .map(|m| MemberRow {
                    name: m.name,
                    state: colored_state(m.state),
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::blank()));
            Ok(())
        }
        Response::Error { kind, message } => Err(daemon_error(kind, message)),
        other => Err(CliError::Daemon(format!("unexpected response: {:?}", other))),
    }
}

async fn handle_group_status(client: &Client, group: &str) -> Result<()> {
    match client.group_status(group).await? {
        Response::Ok {
            data: Some(ResponseData::Group(state)),
            ..
        } => {
            if let Some(description) = &state.description {
                println!("{} - {}", state.name.bold(), description);
            } else {
                println!("{}", state.name.bold());
            }
            let rows: Vec<MemberRow> = state
                .members
                .into_iter()
                .map(|m| MemberRow {
                    name: m.name,
                    state: colored_state(m.state),
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::blank()));
            Ok(())
        }
        Response::Error { kind, message } => Err(daemon_error(kind, message)),
        other => Err(CliError::Daemon(format!("unexpected response: {:?}", other))),
    }
}

async fn handle_status(client: &Client, operation_id: &str) -> Result<()> {
    match client.operation_status(operation_id).await? {
        Response::Ok {
            data: Some(ResponseData::Operation(snapshot)),
            ..
        } => {
            print_operation(&snapshot);
            Ok(())
        }
        Response::Error { kind, message } => Err(daemon_error(kind, message)),
        other => Err(CliError::Daemon(format!("unexpected response: {:?}", other))),
    }
}

fn print_operation(snapshot: &OperationSnapshot) {
    let state = match snapshot.state {
        OperationState::Completed => snapshot.state.as_str().green().to_string(),
        OperationState::Error => snapshot.state.as_str().red().to_string(),
        _ => snapshot.state.as_str().yellow().to_string(),
    };
    println!("{} {} [{}]", snapshot.id.bold(), snapshot.kind, state);
    println!("  {}", summary_line(&snapshot.counters));

    for name in &snapshot.targets {
        let Some(result) = snapshot.results.get(name) else {
            println!("  {} {}", name, "pending".dimmed());
            continue;
        };
        let outcome = match result.outcome {
            Outcome::Failed => result.outcome.as_str().red().to_string(),
            _ => result.outcome.as_str().green().to_string(),
        };
        match &result.detail {
            Some(detail) => println!("  {} {} ({})", name, outcome, detail),
            None => println!("  {} {}", name, outcome),
        }
        for script in &result.scripts {
            let mark = if script.succeeded() {
                "+".green().to_string()
            } else {
                "-".red().to_string()
            };
            println!(
                "    {} {} {} attempt {} ({}ms{})",
                mark,
                script.origin.as_str(),
                script.phase,
                script.attempt,
                script.duration_ms,
                if script.timed_out { ", timed out" } else { "" },
            );
        }
    }
}

fn print_plain_response(response: Response) {
    match response {
        Response::Ok { message, .. } => {
            if let Some(msg) = message {
                println!("{}", msg);
            }
        }
        Response::Error { message, .. } => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
    }
}

fn daemon_error(kind: ErrorKind, message: String) -> CliError {
    CliError::Daemon(format!("{} ({})", message, kind.as_str()))
}

// --- daemon management -----------------------------------------------------

async fn handle_daemon_command(command: &DaemonCommands) -> Result<()> {
    let socket_path = Daemon::socket_path().map_err(|e| CliError::Daemon(e.to_string()))?;

    match command {
        DaemonCommands::Start { detach } => {
            if Client::is_daemon_running(&socket_path).await {
                println!("Daemon is already running");
                return Ok(());
            }

            let daemon_path = find_daemon_binary()?;
            if *detach {
                let child = std::process::Command::new(&daemon_path)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .spawn()
                    .map_err(|e| CliError::DaemonSpawn {
                        path: daemon_path.clone(),
                        source: e,
                    })?;
                drop(child);

                let deadline = std::time::Instant::now() + DAEMON_START_TIMEOUT;
                while std::time::Instant::now() < deadline {
                    if Client::is_daemon_running(&socket_path).await {
                        println!("Daemon started");
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(CliError::DaemonStartTimeout)
            } else {
                // Foreground: replace this process's purpose with the daemon.
                let status = std::process::Command::new(&daemon_path)
                    .status()
                    .map_err(|e| CliError::DaemonSpawn {
                        path: daemon_path,
                        source: e,
                    })?;
                std::process::exit(status.code().unwrap_or(1));
            }
        }

        DaemonCommands::Stop => {
            if !Client::is_daemon_running(&socket_path).await {
                println!("Daemon is not running");
                return Ok(());
            }
            let client = Client::connect(&socket_path).await?;
            print_plain_response(client.shutdown().await?);
            Ok(())
        }

        DaemonCommands::Status => {
            if !Client::is_daemon_running(&socket_path).await {
                println!("Daemon is not running");
                return Ok(());
            }
            let client = Client::connect(&socket_path).await?;
            match client.ping().await? {
                Response::Ok {
                    data: Some(ResponseData::DaemonInfo(info)),
                    ..
                } => {
                    println!("Daemon running (pid {})", info.pid);
                    println!("  uptime: {}s", info.uptime_secs);
                    println!("  tracked operations: {}", info.operations);
                    Ok(())
                }
                Response::Error { kind, message } => Err(daemon_error(kind, message)),
                other => Err(CliError::Daemon(format!("unexpected response: {:?}", other))),
            }
        }
    }
}

/// The daemon binary normally sits next to this one; fall back to PATH.
fn find_daemon_binary() -> Result<PathBuf> {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let candidate = dir.join("berth-daemon");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("berth-daemon");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(CliError::DaemonNotFound)
}
