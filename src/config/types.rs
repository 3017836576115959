/// Core types shared across the sandbox: requests, profiles, outcomes, errors
use crate::utils::output::OutputIntegrity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Caller-supplied limit overrides.
///
/// Every field is optional; unset fields fall back to the configured defaults.
/// Values above the configured maxima are rejected, never clamped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub cpu_time_ms: Option<u64>,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub output_bytes: Option<u64>,
    #[serde(default)]
    pub max_processes: Option<u32>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self == &LimitOverrides::default()
    }
}

/// Immutable request value, owned by the caller until admitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Program text written into the scratch area before launch
    #[serde(with = "lossy_bytes")]
    pub source: Vec<u8>,
    /// Optional bytes fed to the program's stdin
    #[serde(default, with = "lossy_opt_bytes")]
    pub stdin: Option<Vec<u8>>,
    #[serde(default)]
    pub limits: LimitOverrides,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            stdin: None,
            limits: LimitOverrides::default(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Network access policy for a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkPolicy {
    /// Fresh network namespace with no interfaces up
    #[serde(rename = "isolated")]
    Isolated,
    /// Share the host network namespace
    #[serde(rename = "inherit")]
    Inherit,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::Isolated
    }
}

/// Filesystem view for a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Remount `/` read-only inside a private mount namespace; the scratch
    /// directory stays writable
    pub read_only_root: bool,
}

/// Resolved ceilings attached to one run. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub output_bytes: u64,
    pub max_processes: u32,
    pub max_open_files: u64,
    pub file_size_bytes: u64,
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
}

/// Terminal outcome of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "timed_out")]
    TimedOut,
    #[serde(rename = "killed_over_limit")]
    LimitExceeded,
    #[serde(rename = "crashed")]
    Crashed,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "launch_failure")]
    LaunchFailure,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Completed => write!(f, "completed"),
            OutcomeKind::TimedOut => write!(f, "timed_out"),
            OutcomeKind::LimitExceeded => write!(f, "killed_over_limit"),
            OutcomeKind::Crashed => write!(f, "crashed"),
            OutcomeKind::Rejected => write!(f, "rejected"),
            OutcomeKind::LaunchFailure => write!(f, "launch_failure"),
        }
    }
}

/// Which ceiling a `killed_over_limit` run violated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "cpu_time")]
    CpuTime,
    #[serde(rename = "file_size")]
    FileSize,
    #[serde(rename = "processes")]
    Processes,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Memory => write!(f, "memory"),
            LimitKind::CpuTime => write!(f, "cpu_time"),
            LimitKind::FileSize => write!(f, "file_size"),
            LimitKind::Processes => write!(f, "processes"),
        }
    }
}

/// Why a request never ran.
///
/// `QueueFull` and `QueueTimeout` are both "overloaded": the sandbox was too
/// busy, as opposed to the program running too long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "queue_full")]
    QueueFull,
    #[serde(rename = "queue_timeout")]
    QueueTimeout,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "source_too_large")]
    SourceTooLarge,
    #[serde(rename = "invalid_limits")]
    InvalidLimits,
}

impl RejectReason {
    pub fn is_overloaded(self) -> bool {
        matches!(self, RejectReason::QueueFull | RejectReason::QueueTimeout)
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::QueueFull => write!(f, "queue_full"),
            RejectReason::QueueTimeout => write!(f, "queue_timeout"),
            RejectReason::Cancelled => write!(f, "cancelled"),
            RejectReason::SourceTooLarge => write!(f, "source_too_large"),
            RejectReason::InvalidLimits => write!(f, "invalid_limits"),
        }
    }
}

/// Terminal value produced exactly once per request.
///
/// Usage fields are `None` when they could not be measured, which is distinct
/// from a measured zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub kind: OutcomeKind,
    pub stdout: String,
    pub stderr: String,
    /// Set when the text above is not everything the program wrote
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// How each capture ended; anything but `complete` means partial text
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    /// Bytes written to each stream, including ones past the cap
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub limit: Option<LimitKind>,
    pub reject_reason: Option<RejectReason>,
    /// Set when the caller abandoned the run; reported as `timed_out`
    pub cancelled: bool,
    /// Host-side failure detail for `launch_failure` and `rejected`
    pub error: Option<String>,
    pub wall_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_bytes: Option<u64>,
    pub queue_wait_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// A result for a request that never reached a sandbox
    pub fn rejected(
        run_id: String,
        reason: RejectReason,
        detail: Option<String>,
        submitted_at: DateTime<Utc>,
        queue_wait: Option<Duration>,
    ) -> Self {
        Self {
            run_id,
            kind: OutcomeKind::Rejected,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::Complete,
            stdout_bytes: 0,
            stderr_bytes: 0,
            exit_code: None,
            signal: None,
            limit: None,
            reject_reason: Some(reason),
            cancelled: reason == RejectReason::Cancelled,
            error: detail,
            wall_time_ms: None,
            cpu_time_ms: None,
            peak_memory_bytes: None,
            queue_wait_ms: queue_wait.map(|d| d.as_millis() as u64),
            submitted_at,
        }
    }

    /// A result for a sandbox that could not be created
    pub fn launch_failure(run_id: String, error: &SandboxError, submitted_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            kind: OutcomeKind::LaunchFailure,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::Complete,
            stdout_bytes: 0,
            stderr_bytes: 0,
            exit_code: None,
            signal: None,
            limit: None,
            reject_reason: None,
            cancelled: false,
            error: Some(error.to_string()),
            wall_time_ms: None,
            cpu_time_ms: None,
            peak_memory_bytes: None,
            queue_wait_ms: None,
            submitted_at,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SandboxError::Config(format!("failed to encode result: {}", e)))
    }
}

/// Service health, degraded by supervisor invariant violations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

/// Errors raised inside the sandbox machinery.
///
/// None of these are returned to `submit` callers; they are folded into an
/// `ExecutionResult` of kind `launch_failure`.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Supervisor invariant violated: {0}")]
    Supervisor(String),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Source and stdin travel as raw bytes but serialize as (lossy) UTF-8 text so
/// JSON requests stay readable.
mod lossy_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

mod lossy_opt_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&String::from_utf8_lossy(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<String>::deserialize(d)?.map(String::into_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_to_wire_names() {
        let json = serde_json::to_string(&OutcomeKind::LimitExceeded).unwrap();
        assert_eq!(json, "\"killed_over_limit\"");
        assert_eq!(OutcomeKind::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn overloaded_reasons() {
        assert!(RejectReason::QueueFull.is_overloaded());
        assert!(RejectReason::QueueTimeout.is_overloaded());
        assert!(!RejectReason::Cancelled.is_overloaded());
        assert!(!RejectReason::InvalidLimits.is_overloaded());
    }

    #[test]
    fn rejected_result_leaves_usage_unmeasured() {
        let result = ExecutionResult::rejected(
            "r1".to_string(),
            RejectReason::QueueTimeout,
            None,
            Utc::now(),
            Some(Duration::from_millis(250)),
        );
        assert_eq!(result.kind, OutcomeKind::Rejected);
        assert_eq!(result.queue_wait_ms, Some(250));
        assert!(result.cpu_time_ms.is_none());
        assert!(result.peak_memory_bytes.is_none());
        assert!(!result.cancelled);
    }

    #[test]
    fn request_json_accepts_text_source() {
        let json = r#"{"source":"print(1)","submitted_at":"2024-01-01T00:00:00Z"}"#;
        let req: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.source, b"print(1)");
        assert!(req.stdin.is_none());
        assert!(req.limits.is_empty());
    }

    #[test]
    fn errno_converts_to_io_error() {
        let err: SandboxError = nix::errno::Errno::EPERM.into();
        assert!(matches!(err, SandboxError::Io(_)));
    }
}
