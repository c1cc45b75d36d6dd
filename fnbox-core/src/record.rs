//! Execution records and the sinks that receive them.
//!
//! Every invocation of the engine yields exactly one [`ExecutionRecord`],
//! whether the run succeeded, threw, hit a limit or never started.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::accountant::{AccountantSnapshot, CpuFidelity};
use crate::bridge::LogEntry;

/// What caused an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Http,
    Cron,
    #[default]
    Manual,
    Test,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Cron => "cron",
            Self::Manual => "manual",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Who is invoking, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub trigger: Trigger,
    pub worker_id: Option<String>,
}

impl InvocationContext {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            worker_id: None,
        }
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// The `context` object user code sees: `{ type, workerId, ...extra }`.
    /// Caller keys win over the generated ones.
    pub fn sandbox_context(&self, extra: Value) -> Value {
        let mut context = serde_json::Map::new();
        context.insert("type".into(), Value::String(self.trigger.to_string()));
        if let Some(worker_id) = &self.worker_id {
            context.insert("workerId".into(), Value::String(worker_id.clone()));
        }
        if let Value::Object(extra) = extra {
            context.extend(extra);
        }
        Value::Object(context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// The persisted outcome of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worker_id: Option<String>,
    pub trigger: Trigger,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub memory_used_bytes: u64,
    pub cpu_time_ns: u64,
    pub cpu_fidelity: CpuFidelity,
    pub request_payload: Value,
    pub response_payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn success(
        invocation: &InvocationContext,
        request_payload: Value,
        response_payload: Value,
        logs: Vec<LogEntry>,
        accountant: AccountantSnapshot,
    ) -> Self {
        Self::assemble(
            invocation,
            ExecutionStatus::Success,
            request_payload,
            response_payload,
            None,
            logs,
            accountant,
        )
    }

    pub fn failure(
        invocation: &InvocationContext,
        request_payload: Value,
        error: String,
        logs: Vec<LogEntry>,
        accountant: AccountantSnapshot,
    ) -> Self {
        Self::assemble(
            invocation,
            ExecutionStatus::Failed,
            request_payload,
            Value::Null,
            Some(error),
            logs,
            accountant,
        )
    }

    fn assemble(
        invocation: &InvocationContext,
        status: ExecutionStatus,
        request_payload: Value,
        response_payload: Value,
        error: Option<String>,
        logs: Vec<LogEntry>,
        accountant: AccountantSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: invocation.worker_id.clone(),
            trigger: invocation.trigger,
            status,
            duration_ms: accountant.wall_time_ms,
            memory_used_bytes: accountant.heap_used_bytes,
            cpu_time_ns: accountant.cpu_time_ns,
            cpu_fidelity: accountant.cpu_fidelity,
            request_payload,
            response_payload,
            error,
            logs,
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Receives every record the engine produces.
#[async_trait]
pub trait ExecutionRecordSink: Send + Sync {
    async fn persist(&self, record: &ExecutionRecord) -> anyhow::Result<()>;
}

/// Keeps records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionRecordSink for MemorySink {
    async fn persist(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// Emits one summary event per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ExecutionRecordSink for TracingSink {
    async fn persist(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        let worker_id = record.worker_id.as_deref().unwrap_or("-");
        if record.is_success() {
            info!(
                id = %record.id,
                worker_id,
                trigger = %record.trigger,
                duration_ms = record.duration_ms,
                memory_used_bytes = record.memory_used_bytes,
                cpu_time_ns = record.cpu_time_ns,
                logs = record.logs.len(),
                "execution succeeded"
            );
        } else {
            warn!(
                id = %record.id,
                worker_id,
                trigger = %record.trigger,
                duration_ms = record.duration_ms,
                error = record.error.as_deref().unwrap_or_default(),
                "execution failed"
            );
        }
        Ok(())
    }
}

/// Aggregates over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub avg_duration_ms: f64,
    pub avg_memory_used_bytes: f64,
    pub avg_cpu_time_ns: f64,
}

impl ExecutionStats {
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let total = records.len();
        if total == 0 {
            return Self::default();
        }
        let success = records.iter().filter(|r| r.is_success()).count();
        let avg = |field: fn(&ExecutionRecord) -> u64| {
            records.iter().map(|r| field(r) as f64).sum::<f64>() / total as f64
        };
        Self {
            total,
            success,
            failed: total - success,
            avg_duration_ms: avg(|r| r.duration_ms),
            avg_memory_used_bytes: avg(|r| r.memory_used_bytes),
            avg_cpu_time_ns: avg(|r| r.cpu_time_ns),
        }
    }
}
