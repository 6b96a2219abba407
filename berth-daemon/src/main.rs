use std::path::PathBuf;
use std::sync::Arc;

use berth_daemon::Daemon;
use berth_daemon::config::{BerthConfig, DEFAULT_CONFIG_FILE};
use berth_daemon::coordinator::Coordinator;
use berth_daemon::errors::DaemonError;
use berth_daemon::orchestrator::Orchestrator;
use berth_daemon::runtime::{ContainerRuntime, DockerRuntime};
use berth_protocol::protocol::{DaemonInfo, Request, Response, ResponseData};
use berth_protocol::server::{Server, ShutdownTx};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

/// Berth daemon - lifecycle operations for sandboxed dev containers
#[derive(Parser)]
#[command(name = "berth-daemon", about = "Berth daemon for container lifecycle operations")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Container runtime binary to drive
    #[arg(long, default_value = "docker")]
    runtime_binary: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("starting berth daemon");

    // State directory with owner-only permissions.
    let state_dir = Daemon::state_dir()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&state_dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(&state_dir)?;

    let pid_file = Daemon::pid_file()?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&pid_file)?;
        file.write_all(std::process::id().to_string().as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&pid_file, std::process::id().to_string())?;

    let config_path = args
        .file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Arc::new(BerthConfig::load(&config_path)?);
    info!(
        "loaded {} container(s), {} group(s) from {}",
        config.containers.len(),
        config.groups.len(),
        config_path.display()
    );

    let docker = DockerRuntime::new(args.runtime_binary);
    if let Err(e) = docker.ping().await {
        warn!("container runtime not reachable yet: {}", e);
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let orchestrator = Arc::new(Orchestrator::new(runtime, config.settings.clone()));
    let _sweep = orchestrator.spawn_eviction_sweep();
    let coordinator = Arc::new(Coordinator::new(config, orchestrator));

    let started_at = Utc::now();
    let handler_coordinator = coordinator.clone();
    let handler = move |request: Request, shutdown_tx: ShutdownTx| {
        let coordinator = handler_coordinator.clone();
        async move { handle_request(request, coordinator, shutdown_tx, started_at).await }
    };

    let socket_path = Daemon::socket_path()?;
    let server = Server::new(socket_path.clone(), handler)?;
    info!("daemon listening on {:?}", socket_path);

    server.run().await?;

    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

async fn handle_request(
    request: Request,
    coordinator: Arc<Coordinator>,
    shutdown_tx: ShutdownTx,
    started_at: chrono::DateTime<Utc>,
) -> Response {
    match request {
        Request::Start { name } => accepted(coordinator.start(&name)),
        Request::Stop { name } => accepted(coordinator.stop(&name)),
        Request::Restart { name } => accepted(coordinator.restart(&name)),
        Request::Cleanup { name } => accepted(coordinator.cleanup(&name)),
        Request::GroupStart { group } => accepted(coordinator.group_start(&group)),
        Request::GroupStop { group } => accepted(coordinator.group_stop(&group)),
        Request::StopAll => accepted(coordinator.stop_all().await),
        Request::RestartAll => accepted(coordinator.restart_all().await),
        Request::CleanupAll => accepted(coordinator.cleanup_all().await),

        Request::OperationStatus { id } => match coordinator.operation_status(&id) {
            Ok(snapshot) => Response::ok_with_data(ResponseData::Operation(snapshot)),
            Err(e) => error_response(e),
        },
        Request::CancelOperation { id } => match coordinator.cancel_operation(&id) {
            Ok(()) => Response::ok_with_message(format!("cancellation requested for {}", id)),
            Err(e) => error_response(e),
        },
        Request::GroupStatus { group } => match coordinator.group_status(&group).await {
            Ok(state) => Response::ok_with_data(ResponseData::Group(state)),
            Err(e) => error_response(e),
        },
        Request::ListManaged => match coordinator.list_managed().await {
            Ok(members) => Response::ok_with_data(ResponseData::Managed(members)),
            Err(e) => error_response(e),
        },

        Request::Ping => Response::ok_with_data(ResponseData::DaemonInfo(DaemonInfo {
            pid: std::process::id(),
            uptime_secs: (Utc::now() - started_at).num_seconds().max(0) as u64,
            operations: coordinator.orchestrator().operation_count(),
        })),
        Request::Shutdown => {
            info!("shutdown requested");
            let _ = shutdown_tx.send(()).await;
            Response::ok_with_message("daemon shutting down")
        }
    }
}

fn accepted(result: Result<String, DaemonError>) -> Response {
    match result {
        Ok(operation_id) => Response::accepted(operation_id),
        Err(e) => error_response(e),
    }
}

fn error_response(e: DaemonError) -> Response {
    Response::error(e.wire_kind(), e.to_string())
}
