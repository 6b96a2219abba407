//! Thin call surface over the container runtime.
//!
//! The trait is the seam between the orchestrator core and the actual
//! runtime; `DockerRuntime` drives the `docker` CLI, the test suite plugs in
//! a fake. Errors split into `Unavailable` (the runtime itself cannot be
//! reached — fatal to a whole operation) and `Failed` (one container's
//! action failed — folded into that container's outcome).

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ContainerSpec;

/// Label identifying containers owned by this system.
pub const MANAGED_LABEL: &str = "berth.managed=true";

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(200);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation token backed by an `AtomicBool`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container runtime itself cannot be reached.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// One container's action failed; the message is preserved verbatim.
    #[error("{name}: {message}")]
    Failed { name: String, message: String },
}

impl RuntimeError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Failed {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Observed state of a container. `Running` carries the runtime container id,
/// which identifies the instance for script idempotence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running { instance: String },
    Exited,
    Absent,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running { .. })
    }

    pub fn to_run_state(&self) -> berth_protocol::protocol::RunState {
        match self {
            ContainerState::Running { .. } => berth_protocol::protocol::RunState::Running,
            ContainerState::Exited => berth_protocol::protocol::RunState::Exited,
            ContainerState::Absent => berth_protocol::protocol::RunState::Absent,
        }
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    Stopped,
    NotFound,
}

/// Limits applied to one exec invocation.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub max_output_lines: usize,
    pub cancel: CancelToken,
}

/// Captured result of one exec invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// `None` when the process timed out, was cancelled, or died to a signal.
    pub exit_code: Option<i32>,
    /// Captured lines; stderr lines carry a `stderr: ` prefix.
    pub output: Vec<String>,
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start the container, or start it if it merely exists.
    async fn ensure_started(&self, name: &str, spec: Option<&ContainerSpec>) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<StopResult>;

    /// Remove the container. With `purge_volumes`, also remove its image and
    /// the named volumes it exclusively owns (shared ones are left alone).
    async fn remove(&self, name: &str, purge_volumes: bool) -> Result<()>;

    async fn inspect(&self, name: &str) -> Result<ContainerState>;

    /// Names of all containers bearing the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<String>>;

    /// Run a command inside the container, capturing bounded output.
    async fn exec(&self, name: &str, command: &[String], opts: &ExecOptions) -> Result<ExecOutput>;
}

/// Incrementally filled, line-capped capture buffer.
struct CaptureBuf {
    lines: Vec<String>,
    max: usize,
    truncated: bool,
}

impl CaptureBuf {
    fn new(max: usize) -> Self {
        Self {
            lines: Vec::new(),
            max,
            truncated: false,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() < self.max {
            self.lines.push(line);
        } else {
            self.truncated = true;
        }
    }
}

/// Adapter over the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Probe the runtime; used at daemon startup for an early warning.
    pub async fn ping(&self) -> Result<()> {
        self.run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
    }

    /// Run a docker subcommand to completion and return stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_daemon_unreachable(&stderr) {
                Err(RuntimeError::Unavailable(stderr))
            } else {
                Err(RuntimeError::Failed {
                    name: args.get(1).unwrap_or(&"").to_string(),
                    message: stderr,
                })
            }
        }
    }
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
        || stderr.contains("error during connect")
}

fn is_no_such_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_started(&self, name: &str, spec: Option<&ContainerSpec>) -> Result<()> {
        match self.inspect(name).await? {
            ContainerState::Running { .. } => Ok(()),
            ContainerState::Exited => {
                self.run(&["start", name]).await.map(|_| ()).map_err(|e| match e {
                    RuntimeError::Failed { message, .. } => RuntimeError::failed(name, message),
                    other => other,
                })
            }
            ContainerState::Absent => {
                let spec = spec.ok_or_else(|| {
                    RuntimeError::failed(name, "container does not exist and is not defined in the configuration")
                })?;

                let mut args: Vec<String> = vec![
                    "run".into(),
                    "-d".into(),
                    "--name".into(),
                    name.into(),
                    "--label".into(),
                    MANAGED_LABEL.into(),
                ];
                for port in &spec.ports {
                    args.push("-p".into());
                    args.push(port.clone());
                }
                for (key, value) in &spec.env {
                    args.push("-e".into());
                    args.push(format!("{}={}", key, value));
                }
                for volume in &spec.volumes {
                    args.push("-v".into());
                    args.push(volume.clone());
                }
                args.push(spec.image.clone());

                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(&arg_refs).await.map(|_| ()).map_err(|e| match e {
                    RuntimeError::Failed { message, .. } => RuntimeError::failed(name, message),
                    other => other,
                })
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<StopResult> {
        match self.run(&["stop", name]).await {
            Ok(_) => Ok(StopResult::Stopped),
            Err(RuntimeError::Failed { message, .. }) if is_no_such_object(&message) => {
                Ok(StopResult::NotFound)
            }
            Err(RuntimeError::Failed { message, .. }) => Err(RuntimeError::failed(name, message)),
            Err(other) => Err(other),
        }
    }

    async fn remove(&self, name: &str, purge_volumes: bool) -> Result<()> {
        // Record image and named volumes before the container disappears.
        let image = self
            .run(&["inspect", "--format", "{{.Config.Image}}", name])
            .await
            .ok();
        let volumes = if purge_volumes {
            self.run(&[
                "inspect",
                "--format",
                r#"{{range .Mounts}}{{if eq .Type "volume"}}{{.Name}} {{end}}{{end}}"#,
                name,
            ])
            .await
            .map(|out| {
                out.split_whitespace()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
        } else {
            Vec::new()
        };

        match self.run(&["rm", "-f", name]).await {
            Ok(_) => {}
            Err(RuntimeError::Failed { message, .. }) if is_no_such_object(&message) => {}
            Err(RuntimeError::Failed { message, .. }) => {
                return Err(RuntimeError::failed(name, message));
            }
            Err(other) => return Err(other),
        }

        if purge_volumes {
            // An image or volume still used elsewhere is shared, not
            // exclusively owned; leave it in place.
            if let Some(image) = image {
                if let Err(e) = self.run(&["rmi", &image]).await {
                    debug!("leaving image {} in place: {}", image, e);
                }
            }
            for volume in volumes {
                if let Err(e) = self.run(&["volume", "rm", &volume]).await {
                    debug!("leaving volume {} in place: {}", volume, e);
                }
            }
        }

        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        match self
            .run(&["inspect", "--format", "{{.State.Status}} {{.Id}}", name])
            .await
        {
            Ok(out) => {
                let mut parts = out.split_whitespace();
                let status = parts.next().unwrap_or("");
                let id = parts.next().unwrap_or("").to_string();
                if status == "running" {
                    Ok(ContainerState::Running { instance: id })
                } else {
                    Ok(ContainerState::Exited)
                }
            }
            Err(RuntimeError::Failed { message, .. }) if is_no_such_object(&message) => {
                Ok(ContainerState::Absent)
            }
            Err(other) => Err(other),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let out = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                &format!("label={}", MANAGED_LABEL),
                "--format",
                "{{.Names}}",
            ])
            .await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn exec(&self, name: &str, command: &[String], opts: &ExecOptions) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec").arg(name).args(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", self.binary, e)))?;

        let capture = Arc::new(Mutex::new(CaptureBuf::new(opts.max_output_lines)));

        let stdout_task = child.stdout.take().map(|stdout| {
            let capture = capture.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    capture.lock().push(line);
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let capture = capture.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    capture.lock().push(format!("stderr: {}", line));
                }
            })
        });

        let start = Instant::now();
        let mut timed_out = false;
        let mut cancelled = false;

        let exit_code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {}
                Err(e) => {
                    warn!("error polling exec in {}: {}", name, e);
                    break None;
                }
            }

            if opts.cancel.is_cancelled() {
                cancelled = true;
                terminate(&mut child).await;
                break None;
            }

            if start.elapsed() > opts.timeout {
                timed_out = true;
                terminate(&mut child).await;
                break None;
            }

            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let capture = capture.lock();
        Ok(ExecOutput {
            exit_code,
            output: capture.lines.clone(),
            truncated: capture.truncated,
            timed_out,
            cancelled,
        })
    }
}

/// Graceful termination: SIGTERM, a bounded wait, then a hard kill.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            debug!("sending SIGTERM to process {}", pid);
            // SAFETY: pid comes from a live child handle.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("process did not terminate within grace period, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_buf_truncates_at_cap() {
        let mut buf = CaptureBuf::new(2);
        buf.push("one".into());
        buf.push("two".into());
        assert!(!buf.truncated);
        buf.push("three".into());
        assert!(buf.truncated);
        assert_eq!(buf.lines.len(), 2);
    }

    #[test]
    fn unreachable_daemon_is_detected_from_stderr() {
        assert!(is_daemon_unreachable(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(!is_daemon_unreachable("No such container: web"));
    }

    #[test]
    fn missing_container_is_detected_from_stderr() {
        assert!(is_no_such_object("Error: No such container: web"));
        assert!(is_no_such_object("Error: No such object: web"));
        assert!(!is_no_such_object("conflict: unable to remove image"));
    }

    #[test]
    fn cancel_token_is_visible_across_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
