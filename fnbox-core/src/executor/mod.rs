//! Sandbox Backend Trait - Interchangeable Isolation Interface
//!
//! Both isolation backends implement [`SandboxBackend`]. The engine picks
//! one at construction from a [`BackendKind`] and holds it as
//! `Arc<dyn SandboxBackend>`; nothing downstream branches on the backend.
//!
//! # Design Philosophy:
//! - **One run, one sandbox**: a backend never reuses an isolate
//! - **Same result shape**: both backends report [`RunOutput`] / [`RunFailure`]
//! - **Async-First**: runs are futures for tokio integration

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::accountant::AccountantSnapshot;
use crate::bridge::{HostBridge, LogEntry};
use crate::engine::resource_limits::Limits;
use crate::engine::{IsolateBackend, WorkerBackend};
use crate::error::RunError;

/// One untrusted program plus its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Full program body; may define `fetch(payload, context)`.
    pub code: String,
    pub payload: Value,
    pub context: Value,
}

impl SourceUnit {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            payload: Value::Object(Default::default()),
            context: Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// A settled run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Classified, rendered result.
    pub result: Value,
    pub logs: Vec<LogEntry>,
    pub accountant: AccountantSnapshot,
}

/// A failed run, with whatever was captured before the failure.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub error: RunError,
    pub logs: Vec<LogEntry>,
    pub accountant: AccountantSnapshot,
}

impl RunFailure {
    /// Failure before any sandbox existed.
    pub fn early(error: RunError) -> Self {
        Self {
            error,
            logs: Vec::new(),
            accountant: AccountantSnapshot::zero(),
        }
    }
}

pub type RunResult = Result<RunOutput, RunFailure>;

/// The contract every isolation backend satisfies.
///
/// # Performance Contract:
/// - `run()` creates and destroys exactly one interpreter
/// - `run()` never panics and never returns before the sandbox is torn
///   down or scheduled for teardown
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Execute one source unit in a fresh sandbox.
    async fn run(&self, unit: SourceUnit) -> RunResult;

    /// Backend identifier used in traces.
    fn name(&self) -> &'static str;
}

/// Which backend a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process V8 isolate with live capability handles.
    #[default]
    Isolate,
    /// Worker thread with message-passing capabilities.
    Worker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolate => write!(f, "isolate"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" | "in-process" => Ok(Self::Isolate),
            "worker" | "worker-thread" => Ok(Self::Worker),
            other => Err(format!("unknown backend '{other}' (expected isolate or worker)")),
        }
    }
}

/// Build the backend a deployment selected.
pub fn select_backend(kind: BackendKind, bridge: HostBridge, limits: Limits) -> Arc<dyn SandboxBackend> {
    match kind {
        BackendKind::Isolate => Arc::new(IsolateBackend::new(bridge, limits)),
        BackendKind::Worker => Arc::new(WorkerBackend::new(bridge, limits)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HttpClient, RequestSettings};
    use serde_json::json;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("isolate".parse::<BackendKind>(), Ok(BackendKind::Isolate));
        assert_eq!(" Worker ".parse::<BackendKind>(), Ok(BackendKind::Worker));
        assert!("docker".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Worker.to_string(), "worker");
    }

    #[test]
    fn test_source_unit_defaults_to_empty_objects() {
        let unit = SourceUnit::new("return 1").with_payload(json!({"a": 1}));
        assert_eq!(unit.payload, json!({"a": 1}));
        assert_eq!(unit.context, json!({}));
    }

    #[tokio::test]
    async fn test_select_backend_by_kind() {
        let bridge = HostBridge::new(HttpClient::new(RequestSettings::default()).unwrap());
        let isolate = select_backend(BackendKind::Isolate, bridge.clone(), Limits::default());
        let worker = select_backend(BackendKind::Worker, bridge, Limits::default());
        assert_eq!(isolate.name(), "isolate");
        assert_eq!(worker.name(), "worker");
    }
}
