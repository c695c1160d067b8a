//! Stable error taxonomy shared by every supervisor component.

use serde::Serialize;
use std::fmt;

/// A single supervisor error, carrying a stable `code` for the wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    // process lifecycle
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("process {0} is not running")]
    ProcessNotRunning(u32),
    #[error("no child handle tracked for pid {0}")]
    ChildProcessNotFound(u32),

    // spawn
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    // permission / security
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("security violation: {0}")]
    SecurityViolation(String),
    #[error("executable `{0}` is not in the allowlist")]
    NotInAllowlist(String),
    #[error("executable `{0}` is on the dangerous-executable list")]
    DangerousExecutable(String),
    #[error("executable `{0}` has the setuid/setgid bit set")]
    SetuidBlocked(String),
    #[error("executable `{0}` is a shell interpreter and shells are blocked")]
    ShellBlocked(String),

    // validation
    #[error("argument contains a command-injection indicator: {0}")]
    ArgumentInjection(String),
    #[error("argument contains a path-traversal indicator: {0}")]
    ArgumentTraversal(String),
    #[error("working directory `{0}` is not permitted")]
    WorkingDirectoryRestricted(String),
    #[error("environment variable `{0}` is blocked")]
    EnvVarBlocked(String),
    #[error("environment variable `{0}` contains an injection indicator")]
    EnvVarInjection(String),
    #[error("environment variable `{0}` exceeds the maximum length")]
    EnvVarTooLong(String),
    #[error("aggregate environment size exceeds the maximum")]
    EnvSizeExceeded,

    // resources
    #[error("cpu usage exceeded the configured limit")]
    CpuLimitExceeded,
    #[error("memory usage exceeded the configured limit")]
    MemoryLimitExceeded,
    #[error("cpu time / wall-clock limit exceeded")]
    CpuTimeLimitExceeded,
    #[error("concurrent process limit exceeded")]
    ConcurrentLimitExceeded,
    #[error("launch rate limit exceeded for agent `{0}`")]
    RateLimitExceeded(String),

    // io
    #[error("stdin is not available for pid {0}")]
    StdinNotAvailable(u32),
    #[error("stdin is not writable for pid {0}")]
    StdinNotWritable(u32),
    #[error("failed to write to stdin: {0}")]
    StdinWriteFailed(String),

    // termination
    #[error("termination of pid {0} failed: {1}")]
    TerminationFailed(u32, String),
    #[error("operation timed out")]
    TimeoutExceeded,
    #[error("pid {0} is not managed by this supervisor")]
    SignalToUnmanaged(u32),

    // groups / services
    #[error("group `{0}` not found")]
    GroupNotFound(String),
    #[error("service `{0}` not found")]
    ServiceNotFound(String),
    #[error("service `{0}` already exists")]
    ServiceExists(String),

    // system
    #[error("system is out of memory")]
    OutOfMemory,
    #[error("system is out of file descriptors")]
    OutOfFileDescriptors,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SupervisorError {
    /// Stable machine-readable code used in the wire `ErrorResponse`.
    pub fn code(&self) -> &'static str {
        use SupervisorError::*;
        match self {
            ProcessNotFound(_) => "ProcessNotFound",
            ProcessNotRunning(_) => "ProcessNotRunning",
            ChildProcessNotFound(_) => "ChildProcessNotFound",
            SpawnFailed(_) => "SpawnFailed",
            ExecutableNotFound(_) => "ExecutableNotFound",
            PermissionDenied(_) => "PermissionDenied",
            SecurityViolation(_) => "SecurityViolation",
            NotInAllowlist(_) => "NotInAllowlist",
            DangerousExecutable(_) => "DangerousExecutable",
            SetuidBlocked(_) => "SetuidBlocked",
            ShellBlocked(_) => "ShellBlocked",
            ArgumentInjection(_) => "ArgumentInjection",
            ArgumentTraversal(_) => "ArgumentTraversal",
            WorkingDirectoryRestricted(_) => "WorkingDirectoryRestricted",
            EnvVarBlocked(_) => "EnvVarBlocked",
            EnvVarInjection(_) => "EnvVarInjection",
            EnvVarTooLong(_) => "EnvVarTooLong",
            EnvSizeExceeded => "EnvSizeExceeded",
            CpuLimitExceeded => "CpuLimitExceeded",
            MemoryLimitExceeded => "MemoryLimitExceeded",
            CpuTimeLimitExceeded => "CpuTimeLimitExceeded",
            ConcurrentLimitExceeded => "ConcurrentLimitExceeded",
            RateLimitExceeded(_) => "RateLimitExceeded",
            StdinNotAvailable(_) => "StdinNotAvailable",
            StdinNotWritable(_) => "StdinNotWritable",
            StdinWriteFailed(_) => "StdinWriteFailed",
            TerminationFailed(..) => "TerminationFailed",
            TimeoutExceeded => "TimeoutExceeded",
            SignalToUnmanaged(_) => "SignalToUnmanaged",
            GroupNotFound(_) => "GroupNotFound",
            ServiceNotFound(_) => "ServiceNotFound",
            ServiceExists(_) => "ServiceExists",
            OutOfMemory => "OutOfMemory",
            OutOfFileDescriptors => "OutOfFileDescriptors",
            Unknown(_) => "Unknown",
        }
    }

    /// Short, fixed remediation hint per error family, surfaced on the wire.
    pub fn remediation(&self) -> &'static str {
        use SupervisorError::*;
        match self {
            NotInAllowlist(_) | DangerousExecutable(_) | ShellBlocked(_) | SetuidBlocked(_) => {
                "Add the executable to the allowlist or choose a permitted command."
            }
            ArgumentInjection(_) | ArgumentTraversal(_) => {
                "Remove shell metacharacters and path-traversal sequences from arguments."
            }
            EnvVarBlocked(_) | EnvVarInjection(_) | EnvVarTooLong(_) | EnvSizeExceeded => {
                "Adjust the requested environment to satisfy the security policy."
            }
            WorkingDirectoryRestricted(_) => {
                "Choose a working directory inside an allowed directory."
            }
            ConcurrentLimitExceeded => "Terminate an existing process before starting another.",
            RateLimitExceeded(_) => "Wait for the rolling launch-rate window to clear.",
            CpuLimitExceeded | MemoryLimitExceeded | CpuTimeLimitExceeded => {
                "Lower resource usage or raise the configured limit."
            }
            SignalToUnmanaged(_) => "Only pids created by this supervisor may be signaled.",
            ProcessNotFound(_) | ChildProcessNotFound(_) => {
                "Verify the pid with processList before retrying."
            }
            ServiceExists(_) => "Choose a unique service name or stop the existing service first.",
            ServiceNotFound(_) | GroupNotFound(_) => "Verify the identifier with a list operation.",
            _ => "Retry the operation or consult the supervisor logs.",
        }
    }
}

/// Serializable `{status, code, message, remediation}` error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub code: String,
    pub message: String,
    pub remediation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

impl From<&SupervisorError> for ErrorResponse {
    fn from(err: &SupervisorError) -> Self {
        ErrorResponse {
            status: "error",
            code: err.code().to_string(),
            message: err.to_string(),
            remediation: err.remediation().to_string(),
            details: None,
            timestamp: crate::util::iso_now(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
