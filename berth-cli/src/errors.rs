use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Cannot find berth-daemon binary")]
    DaemonNotFound,

    #[error("Daemon failed to start within timeout")]
    DaemonStartTimeout,

    #[error("Failed to start daemon at {path}: {source}")]
    DaemonSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Daemon(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] berth_protocol::errors::ClientError),
}

pub type Result<T> = std::result::Result<T, CliError>;
