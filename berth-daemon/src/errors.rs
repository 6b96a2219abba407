use std::path::PathBuf;

use berth_protocol::protocol::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Classification exposed on the wire so callers can branch on
    /// "doesn't exist" versus "bad request" versus "runtime down".
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            DaemonError::ContainerNotFound(_)
            | DaemonError::GroupNotFound(_)
            | DaemonError::OperationNotFound(_) => ErrorKind::NotFound,
            DaemonError::Validation(_) => ErrorKind::Validation,
            DaemonError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            DaemonError::Config(_)
            | DaemonError::ConfigParse { .. }
            | DaemonError::ConfigNotFound(_)
            | DaemonError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
