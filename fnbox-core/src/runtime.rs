//! Execution Engine - Admission, Isolation and Record Assembly
//!
//! [`Engine`] is the one entry point callers use. It admits runs through a
//! [`ConcurrencyLimiter`], hands them to the configured backend, bounds
//! each with an outer deadline, and turns every outcome into exactly one
//! [`ExecutionRecord`] which it also hands to the configured sink.
//!
//! # Performance-First Design:
//! - Backend, limiter and HTTP client are built once and shared by all runs
//! - Oversize sources are refused before a sandbox thread is spawned
//! - The outer deadline starts when a run leaves the queue, not when it joins

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::accountant::AccountantSnapshot;
use crate::bridge::{HostBridge, HttpClient};
use crate::config::EngineConfig;
use crate::engine::Limits;
use crate::error::{ResourceLimit, RunError};
use crate::executor::{select_backend, BackendKind, RunFailure, RunResult, SandboxBackend, SourceUnit};
use crate::perf::{EngineMetrics, MetricsSnapshot, ScopedTimer};
use crate::queue::{ConcurrencyLimiter, QueueOptions, QueueRegistry, QueueStatus, TaskObserver};
use crate::record::{ExecutionRecord, ExecutionRecordSink, InvocationContext, TracingSink};

/// Name of the engine's queue in a [`QueueRegistry`].
pub const EXECUTION_QUEUE: &str = "executions";

/// Builds an [`Engine`] from a config plus optional collaborators.
pub struct EngineBuilder<'a> {
    config: EngineConfig,
    sink: Option<Arc<dyn ExecutionRecordSink>>,
    registry: Option<&'a QueueRegistry>,
    observer: Option<Arc<dyn TaskObserver>>,
    backend: Option<Arc<dyn SandboxBackend>>,
}

impl<'a> EngineBuilder<'a> {
    pub fn sink(mut self, sink: Arc<dyn ExecutionRecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share the execution queue through `registry` instead of owning it.
    pub fn registry(mut self, registry: &'a QueueRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use a ready-made backend instead of the configured one.
    pub fn backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let limits = self.config.limits();
        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let http = HttpClient::new(self.config.request.clone())?;
                select_backend(self.config.backend, HostBridge::new(http), limits)
            }
        };

        let mut options = QueueOptions::with_concurrency(limits.concurrency);
        if let Some(observer) = self.observer {
            options = options.observer(observer);
        }
        let limiter = match self.registry {
            Some(registry) => registry.get_or_create::<RunResult>(EXECUTION_QUEUE, options)?,
            None => ConcurrencyLimiter::new(EXECUTION_QUEUE, options),
        };

        info!(
            backend = backend.name(),
            concurrency = limits.concurrency,
            timeout_ms = limits.timeout.as_millis() as u64,
            "engine ready"
        );
        Ok(Engine {
            kind: self.config.backend,
            backend,
            limiter,
            limits,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            metrics: EngineMetrics::new(),
        })
    }
}

/// Runs untrusted programs and records what happened.
pub struct Engine {
    kind: BackendKind,
    backend: Arc<dyn SandboxBackend>,
    limiter: ConcurrencyLimiter<RunResult>,
    limits: Limits,
    sink: Arc<dyn ExecutionRecordSink>,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    /// Engine with the configured backend and a [`TracingSink`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder<'a>(config: EngineConfig) -> EngineBuilder<'a> {
        EngineBuilder {
            config,
            sink: None,
            registry: None,
            observer: None,
            backend: None,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn queue_status(&self) -> Option<QueueStatus> {
        self.limiter.status().await.ok()
    }

    /// Reject runs that are still waiting for a slot.
    pub async fn clear_queue(&self) -> usize {
        self.limiter.clear().await
    }

    /// Stop admitting runs. Running ones finish; queued ones are rejected.
    pub fn shutdown(&self) {
        self.limiter.shutdown();
    }

    /// Run `code` with a manual trigger.
    pub async fn execute(&self, code: &str, payload: Value, context: Value) -> ExecutionRecord {
        self.execute_with(&InvocationContext::default(), code, payload, context)
            .await
    }

    /// Like [`execute`](Self::execute); inputs that fail to serialize become `{}`.
    pub async fn execute_serializable<P, C>(&self, code: &str, payload: &P, context: &C) -> ExecutionRecord
    where
        P: Serialize + ?Sized,
        C: Serialize + ?Sized,
    {
        let payload = to_json_or_empty("payload", payload);
        let context = to_json_or_empty("context", context);
        self.execute(code, payload, context).await
    }

    /// Run `code` on behalf of `invocation`. Never fails: every outcome,
    /// including refusal and infrastructure trouble, becomes a record.
    pub async fn execute_with(
        &self,
        invocation: &InvocationContext,
        code: &str,
        payload: Value,
        context: Value,
    ) -> ExecutionRecord {
        let timer = ScopedTimer::new(&self.metrics);
        let unit = SourceUnit::new(code)
            .with_payload(payload.clone())
            .with_context(invocation.sandbox_context(context));

        let outcome = self.admit(unit).await;
        let record = match outcome {
            Ok(output) => {
                timer.finish(Ok(()));
                ExecutionRecord::success(invocation, payload, output.result, output.logs, output.accountant)
            }
            Err(failure) => {
                timer.finish(Err(&failure.error));
                debug!(
                    worker_id = invocation.worker_id.as_deref().unwrap_or("-"),
                    kind = failure.error.kind(),
                    "run failed"
                );
                ExecutionRecord::failure(
                    invocation,
                    payload,
                    failure.error.to_string(),
                    failure.logs,
                    failure.accountant,
                )
            }
        };

        if let Err(e) = self.sink.persist(&record).await {
            warn!(id = %record.id, error = ?e, "failed to persist execution record");
        }
        record
    }

    async fn admit(&self, unit: SourceUnit) -> RunResult {
        if unit.code.len() > self.limits.max_code_bytes {
            self.metrics.record_rejection();
            return Err(RunFailure::early(RunError::compile(
                "Source exceeds the maximum allowed size",
            )));
        }

        let backend = self.backend.clone();
        let deadline = self.limits.outer_deadline();
        let run = async move {
            let started = Instant::now();
            match tokio::time::timeout(deadline, backend.run(unit)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        backend = backend.name(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "run missed the outer deadline"
                    );
                    Err(RunFailure {
                        error: RunError::ResourceExceeded(ResourceLimit::Timeout),
                        logs: Vec::new(),
                        accountant: AccountantSnapshot::estimated(started.elapsed()),
                    })
                }
            }
        };

        match self.limiter.enqueue(run).await {
            Ok(result) => result,
            Err(e) => {
                let error = RunError::from(e);
                if let RunError::Infrastructure { message } = &error {
                    tracing::error!(error = %message, "execution queue failure");
                }
                Err(RunFailure::early(error))
            }
        }
    }
}

fn to_json_or_empty<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(input = what, error = %e, "input is not serializable, using {{}}");
        json!({})
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{LogEntry, LogLevel};
    use crate::executor::RunOutput;
    use crate::record::{ExecutionStatus, MemorySink};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Echoes its input without an interpreter.
    struct EchoBackend {
        delay: Duration,
    }

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        async fn run(&self, unit: SourceUnit) -> RunResult {
            tokio::time::sleep(self.delay).await;
            if unit.code == "throw" {
                return Err(RunFailure {
                    error: RunError::runtime("Error: boom"),
                    logs: vec![],
                    accountant: AccountantSnapshot::zero(),
                });
            }
            Ok(RunOutput {
                result: json!({"payload": unit.payload, "context": unit.context}),
                logs: vec![LogEntry {
                    level: LogLevel::Log,
                    timestamp_ms: 1,
                    args: vec![json!(unit.code)],
                }],
                accountant: AccountantSnapshot::zero(),
            })
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    fn engine(config: EngineConfig, delay: Duration, sink: Arc<MemorySink>) -> Engine {
        Engine::builder(config)
            .backend(Arc::new(EchoBackend { delay }))
            .sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_records_success() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(EngineConfig::default(), Duration::ZERO, sink.clone());
        let invocation = InvocationContext::new(crate::record::Trigger::Http).worker("w-9");
        let record = engine
            .execute_with(&invocation, "code", json!({"n": 1}), json!({"path": "/"}))
            .await;

        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.request_payload, json!({"n": 1}));
        assert_eq!(
            record.response_payload["context"],
            json!({"type": "http", "workerId": "w-9", "path": "/"})
        );
        assert_eq!(record.logs.len(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(engine.metrics().successes, 1);
    }

    #[tokio::test]
    async fn test_failures_become_records() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(EngineConfig::default(), Duration::ZERO, sink.clone());
        let record = engine.execute("throw", json!({}), json!({})).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Error: boom"));
        assert_eq!(record.response_payload, Value::Null);
        assert_eq!(engine.metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_oversize_source_is_a_compile_error() {
        let config = EngineConfig {
            max_code_bytes: Some(4),
            ..EngineConfig::default()
        };
        let engine = engine(config, Duration::ZERO, Arc::new(MemorySink::new()));
        let record = engine.execute("too long", json!({}), json!({})).await;
        assert!(record.error.unwrap().starts_with("CompileError:"));
        assert_eq!(record.duration_ms, 0);
        assert_eq!(engine.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn test_outer_deadline_times_out_hung_backend() {
        let config = EngineConfig {
            timeout_ms: Some(10),
            worker_grace_ms: Some(0),
            ..EngineConfig::default()
        };
        let engine = engine(config, Duration::from_secs(30), Arc::new(MemorySink::new()));
        tokio::time::pause();
        let record = engine.execute("code", json!({}), json!({})).await;
        assert_eq!(record.error.as_deref(), Some("Execution timed out"));
        assert_eq!(engine.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_unserializable_input_becomes_empty_object() {
        let engine = engine(EngineConfig::default(), Duration::ZERO, Arc::new(MemorySink::new()));
        let mut bad = BTreeMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");
        let record = engine.execute_serializable("code", &bad, &json!({})).await;
        assert_eq!(record.request_payload, json!({}));
    }

    #[tokio::test]
    async fn test_registry_shares_execution_queue() {
        let registry = QueueRegistry::new();
        let engine = Engine::builder(EngineConfig::default())
            .backend(Arc::new(EchoBackend { delay: Duration::ZERO }))
            .registry(&registry)
            .build()
            .unwrap();
        assert_eq!(registry.len(), 1);
        let status = engine.queue_status().await.unwrap();
        assert_eq!(status.concurrency, 5);
    }
}
