use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Cannot resume worker {worker}: {reason}")]
    CannotResume { worker: String, reason: String },

    #[error("Worker {worker} has an invalid reset protocol: {protocol}")]
    InvalidResetProtocol { worker: String, protocol: String },

    #[error("Isolation violation on {worker}: {reason}")]
    IsolationViolation { worker: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unknown build type: {0}")]
    UnknownBuildType(String),

    #[error("{operation} cancelled after {after:?}")]
    Cancelled {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote fault during {operation}: {message}")]
    RemoteFault {
        operation: &'static str,
        message: String,
    },

    #[error("Content unavailable: {sha1}: {reason}")]
    ContentUnavailable { sha1: String, reason: String },

    #[error("Resume of {worker} failed: {detail}")]
    ResumeFailed {
        worker: String,
        detail: ResumeFailure,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a host resume command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFailure {
    /// The command ran past the call timeout and was killed with `signal`.
    Killed { signal: i32 },
    /// The command exited non-zero.
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The command was terminated by a signal it did not get from us.
    Signalled { signal: i32 },
    /// The command could not be started at all.
    Spawn(String),
}

impl std::fmt::Display for ResumeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeFailure::Killed { signal } => write!(f, "timed out, killed with signal {}", signal),
            ResumeFailure::Exited { code, stderr, .. } => {
                write!(f, "exit code {}", code)?;
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr.trim_end())?;
                }
                Ok(())
            }
            ResumeFailure::Signalled { signal } => write!(f, "terminated by signal {}", signal),
            ResumeFailure::Spawn(e) => write!(f, "could not start command: {}", e),
        }
    }
}

impl DispatchError {
    /// Faults that need an operator rather than another scan.
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(
            self,
            DispatchError::RemoteFault { .. }
                | DispatchError::InvalidResetProtocol { .. }
                | DispatchError::ProtocolViolation(_)
        )
    }

    /// Errors caused by the job itself, such as an unregistered build type,
    /// a payload the worker cannot take or an input nobody can supply.
    /// Retrying on another worker fails the same way.
    pub fn is_job_fault(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownBuildType(_)
                | DispatchError::Config(_)
                | DispatchError::ContentUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
