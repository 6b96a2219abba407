use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Maximum frame size (10MB) — local unix socket, no network concerns.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// The kind of job an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
    Cleanup,
    GroupStart,
    GroupStop,
    StopAll,
    RestartAll,
    CleanupAll,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Cleanup => "cleanup",
            OperationKind::GroupStart => "group_start",
            OperationKind::GroupStop => "group_stop",
            OperationKind::StopAll => "stop_all",
            OperationKind::RestartAll => "restart_all",
            OperationKind::CleanupAll => "cleanup_all",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation. `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Error,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Completed => "completed",
            OperationState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Error)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single container settled within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
    Restarted,
    Removed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Started => "started",
            Outcome::AlreadyRunning => "already_running",
            Outcome::Stopped => "stopped",
            Outcome::NotRunning => "not_running",
            Outcome::Restarted => "restarted",
            Outcome::Removed => "removed",
            Outcome::Failed => "failed",
        }
    }
}

/// Per-outcome tallies for an operation. Sums to the target count once the
/// operation completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub started: u32,
    pub already_running: u32,
    pub stopped: u32,
    pub not_running: u32,
    pub restarted: u32,
    pub removed: u32,
    pub failed: u32,
}

impl OutcomeCounters {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Started => self.started += 1,
            Outcome::AlreadyRunning => self.already_running += 1,
            Outcome::Stopped => self.stopped += 1,
            Outcome::NotRunning => self.not_running += 1,
            Outcome::Restarted => self.restarted += 1,
            Outcome::Removed => self.removed += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.started
            + self.already_running
            + self.stopped
            + self.not_running
            + self.restarted
            + self.removed
            + self.failed
    }
}

/// Lifecycle point at which scripts run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPhase {
    PostStart,
    PreStop,
}

impl ScriptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptPhase::PostStart => "post_start",
            ScriptPhase::PreStop => "pre_stop",
        }
    }
}

impl std::fmt::Display for ScriptPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a script came from: the convention-located default or the
/// config-declared custom one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptOrigin {
    Default,
    Custom,
}

impl ScriptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptOrigin::Default => "default",
            ScriptOrigin::Custom => "custom",
        }
    }
}

/// One execution attempt of one lifecycle script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResult {
    pub phase: ScriptPhase,
    pub origin: ScriptOrigin,
    /// 1-based attempt counter, bounded by the configured maximum.
    pub attempt: u32,
    /// Exit code of the attempt. `None` when the script timed out or was
    /// killed by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Captured output lines; stderr lines are tagged with a `stderr: `
    /// prefix.
    pub output: Vec<String>,
    /// True when output was cut off at the configured line cap.
    pub truncated: bool,
    /// True when the attempt exceeded its timeout.
    pub timed_out: bool,
}

impl ScriptResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// How one container settled, with detail and the full script record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<ScriptResult>,
}

/// Point-in-time view of an operation, safe to hand to any poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    /// The containers this operation acts on, fixed at submission.
    pub targets: Vec<String>,
    pub counters: OutcomeCounters,
    /// One human-readable entry per failed container, in settle order.
    pub errors: Vec<String>,
    pub results: HashMap<String, TargetOutcome>,
    /// Seconds since the unix epoch.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// Observable runtime state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Exited,
    Absent,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Exited => "exited",
            RunState::Absent => "absent",
        }
    }
}

/// A container name paired with its current runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    pub name: String,
    pub state: RunState,
}

/// Live aggregate state of a group, independent of any in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub members: Vec<MemberState>,
}

/// Request sent from a front-end to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Cleanup { name: String },
    GroupStart { group: String },
    GroupStop { group: String },
    StopAll,
    RestartAll,
    CleanupAll,
    /// Poll a submitted operation.
    OperationStatus { id: String },
    /// Best-effort cancellation of a pending/running operation.
    CancelOperation { id: String },
    /// Live state of every member of a group.
    GroupStatus { group: String },
    /// Name + state of every container bearing the managed label.
    ListManaged,
    Ping,
    Shutdown,
}

impl Request {
    /// Variant name for lightweight error reporting.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "Start",
            Request::Stop { .. } => "Stop",
            Request::Restart { .. } => "Restart",
            Request::Cleanup { .. } => "Cleanup",
            Request::GroupStart { .. } => "GroupStart",
            Request::GroupStop { .. } => "GroupStop",
            Request::StopAll => "StopAll",
            Request::RestartAll => "RestartAll",
            Request::CleanupAll => "CleanupAll",
            Request::OperationStatus { .. } => "OperationStatus",
            Request::CancelOperation { .. } => "CancelOperation",
            Request::GroupStatus { .. } => "GroupStatus",
            Request::ListManaged => "ListManaged",
            Request::Ping => "Ping",
            Request::Shutdown => "Shutdown",
        }
    }
}

/// Stable error classification so callers can branch on "doesn't exist"
/// versus "the request was bad" versus "the runtime is down".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    RuntimeUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Response sent from the daemon to a front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok {
            message: Some(msg.into()),
            data: None,
        }
    }

    pub fn ok_with_data(data: ResponseData) -> Self {
        Response::Ok {
            message: None,
            data: Some(data),
        }
    }

    /// Response for a freshly accepted lifecycle request.
    pub fn accepted(operation_id: impl Into<String>) -> Self {
        Response::Ok {
            message: None,
            data: Some(ResponseData::Accepted {
                operation_id: operation_id.into(),
            }),
        }
    }

    pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: msg.into(),
        }
    }
}

/// Data payload in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// A lifecycle request was accepted; poll the operation for progress.
    Accepted { operation_id: String },
    Operation(OperationSnapshot),
    Group(GroupState),
    Managed(Vec<MemberState>),
    DaemonInfo(DaemonInfo),
}

/// Daemon liveness information, returned by `Ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub uptime_secs: u64,
    /// Operations currently held in the table (any state).
    pub operations: usize,
}

/// Client-to-server frame with a request id for multiplexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client frame answering the request with the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub response: Response,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(ProtocolError::Encode)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encode a request envelope to length-prefixed JSON bytes.
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a request envelope from a raw payload (framing already stripped).
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}

/// Encode a response envelope to length-prefixed JSON bytes.
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a response envelope from a raw payload (framing already stripped).
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}
