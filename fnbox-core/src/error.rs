//! Error taxonomy for sandboxed runs
//!
//! Every failure a run can produce is normalized into [`RunError`] at the
//! backend boundary. The engine turns it into the `error` string of an
//! [`ExecutionRecord`](crate::record::ExecutionRecord); nothing raised by
//! user code or by a backend escapes `Engine::execute` uncaught.

use std::fmt;
use thiserror::Error;

/// Which host-enforced ceiling a run breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLimit {
    /// V8 heap ceiling (`memory_limit_bytes`).
    Memory,
    /// Wall-clock ceiling (`timeout_ms`).
    Timeout,
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "Execution exceeded its memory limit"),
            Self::Timeout => write!(f, "Execution timed out"),
        }
    }
}

/// Why a sandboxed run did not produce a result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    /// The source never executed (syntax error, oversize source).
    #[error("CompileError: {message}")]
    Compile { message: String },

    /// User code threw or its returned promise rejected.
    #[error("{message}")]
    RuntimeThrow { message: String },

    /// The host stopped the run; the message never reveals the limit value.
    #[error("{0}")]
    ResourceExceeded(ResourceLimit),

    /// A mediated capability call failed outside of user control. It is
    /// rejected into user code as `{name, message}` and only fails the run
    /// if the sandbox leaves it uncaught.
    #[error("HostBridgeError: {message}")]
    HostBridge { message: String },

    /// Backend spawn/teardown failure. Logged host-side with full detail.
    #[error("Internal sandbox error")]
    Infrastructure { message: String },

    /// The run was still queued when its queue was cleared or shut down.
    #[error("Task cancelled due to queue clear")]
    Cancelled,
}

impl RunError {
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeThrow {
            message: message.into(),
        }
    }

    pub fn bridge(message: impl Into<String>) -> Self {
        Self::HostBridge {
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
        }
    }

    /// Error name user code sees on a rejected value.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "CompileError",
            Self::RuntimeThrow { .. } => "Error",
            Self::ResourceExceeded(_) => "ResourceExceeded",
            Self::HostBridge { .. } => "HostBridgeError",
            Self::Infrastructure { .. } => "InfrastructureError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// Short machine-readable label used in traces and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile",
            Self::RuntimeThrow { .. } => "runtime",
            Self::ResourceExceeded(ResourceLimit::Memory) => "oom",
            Self::ResourceExceeded(ResourceLimit::Timeout) => "timeout",
            Self::HostBridge { .. } => "host_bridge",
            Self::Infrastructure { .. } => "infrastructure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failures of the admission queue itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task cancelled due to queue clear")]
    Cancelled,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("queue '{0}' is shut down")]
    Closed(String),

    #[error("queue '{name}' already exists with a different task type")]
    TypeMismatch { name: String },
}

impl From<QueueError> for RunError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Cancelled | QueueError::Closed(_) => RunError::Cancelled,
            other => RunError::infrastructure(other.to_string()),
        }
    }
}

/// Failures while loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to expand environment variables: {0}")]
    Expand(String),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_diagnostics_are_fixed() {
        assert_eq!(
            RunError::ResourceExceeded(ResourceLimit::Timeout).to_string(),
            "Execution timed out"
        );
        assert_eq!(
            RunError::ResourceExceeded(ResourceLimit::Memory).to_string(),
            "Execution exceeded its memory limit"
        );
    }

    #[test]
    fn test_infrastructure_detail_is_hidden() {
        let err = RunError::infrastructure("failed to spawn thread: EAGAIN");
        assert_eq!(err.to_string(), "Internal sandbox error");
        assert_eq!(err.kind(), "infrastructure");
    }

    #[test]
    fn test_runtime_throw_keeps_message() {
        let err = RunError::runtime("Error: boom");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_bridge_error_name_and_kind() {
        let err = RunError::bridge("connection refused");
        assert_eq!(err.name(), "HostBridgeError");
        assert_eq!(err.kind(), "host_bridge");
        assert_eq!(err.to_string(), "HostBridgeError: connection refused");
    }

    #[test]
    fn test_queue_error_conversion() {
        assert_eq!(RunError::from(QueueError::Cancelled), RunError::Cancelled);
        let err = RunError::from(QueueError::TaskPanicked("oops".into()));
        assert_eq!(err.kind(), "infrastructure");
    }
}
