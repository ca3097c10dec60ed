//! Container error types

use crate::process::ProcessError;
use apex_foundation::Error;
use thiserror::Error;

/// Failure of one container engine operation
///
/// Cloneable so it can travel inside structured results and events.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContainerError {
    #[error("No container runtime available (docker or podman)")]
    RuntimeUnavailable,

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Container create failed: {0}")]
    Create(String),

    #[error("Container start failed: {0}")]
    Start(String),

    #[error("Container stop failed: {0}")]
    Stop(String),

    #[error("Container remove failed: {0}")]
    Remove(String),

    #[error("Container exec failed: {0}")]
    Exec(String),

    #[error("Container inspect failed: {0}")]
    Inspect(String),

    #[error("Container stats failed: {0}")]
    Stats(String),

    #[error("Events monitor failed: {0}")]
    Events(String),

    #[error("Container {operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Failed to run container engine: {0}")]
    Spawn(String),
}

impl ContainerError {
    /// Operation name used in [`Error::ContainerOperation`]
    pub fn operation(&self) -> &str {
        match self {
            Self::RuntimeUnavailable => "detect",
            Self::Build(_) => "build",
            Self::Create(_) => "create",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Remove(_) => "remove",
            Self::Exec(_) => "exec",
            Self::Inspect(_) => "inspect",
            Self::Stats(_) => "stats",
            Self::Events(_) => "events",
            Self::Timeout { operation, .. } => operation,
            Self::Spawn(_) => "spawn",
        }
    }

    /// Map a runner failure for `operation`
    pub(crate) fn from_process(operation: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::TimedOut { timeout, .. } => Self::Timeout {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            },
            ProcessError::Spawn { .. } => Self::Spawn(err.to_string()),
        }
    }
}

impl From<ContainerError> for Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::RuntimeUnavailable => Error::RuntimeUnavailable(err.to_string()),
            other => Error::ContainerOperation {
                operation: other.operation().to_string(),
                message: other.to_string(),
            },
        }
    }
}
