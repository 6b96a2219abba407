use std::path::PathBuf;

use crate::errors::{DaemonError, Result};

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod executor;
pub mod operation;
pub mod orchestrator;
pub mod runtime;
pub mod scripts;

const STATE_DIR: &str = ".berth";

pub struct Daemon {}

impl Daemon {
    /// Per-user state directory (`~/.berth`).
    pub fn state_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(STATE_DIR))
            .ok_or_else(|| DaemonError::Config("could not determine home directory".to_string()))
    }

    pub fn socket_path() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("berth.sock"))
    }

    pub fn pid_file() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("berth.pid"))
    }
}
