//! Worker-Thread Backend
//!
//! Runs user code in a restricted interpreter on a short-lived OS thread.
//! The sandbox holds no host handles at all: `console` and `request` are
//! plain functions that post messages to the parent, which appends logs,
//! performs requests and replies with structurally cloned data.
//!
//! Two clocks bound a run. The worker's own watchdog stops the interpreter
//! at `timeout`; the parent gives up at `timeout + worker_grace`, terminates
//! the isolate and reports a timeout. [`WorkerGuard`] terminates the isolate
//! on every exit path that did not see the worker settle.

use std::time::Instant;

use async_trait::async_trait;
use deno_core::v8;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::accountant::AccountantSnapshot;
use crate::boundary::{make_transferable, render, wire, BoundaryValue};
use crate::bridge::request::rejection;
use crate::bridge::{HostBridge, HttpClient, LogBook, LogLevel, RequestConfig};
use crate::error::{ResourceLimit, RunError};
use crate::executor::{RunFailure, RunOutput, RunResult, SandboxBackend, SourceUnit};

use super::isolation::encode_input;
use super::js::{create_runtime, drive, spawn_sandbox, SandboxReport};
use super::ops::{err_envelope, fnbox_worker, ok_envelope, WorkerEvent, WorkerPort};
use super::resource_limits::Limits;

/// Terminates the worker isolate unless the run settled.
#[derive(Default)]
struct WorkerGuard {
    isolate: Option<v8::IsolateHandle>,
}

impl WorkerGuard {
    fn arm(&mut self, isolate: v8::IsolateHandle) {
        self.isolate = Some(isolate);
    }

    fn release(&mut self) {
        self.isolate = None;
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(isolate) = self.isolate.take() {
            if isolate.terminate_execution() {
                debug!("terminated worker isolate");
            }
        }
    }
}

/// Runs every source unit on a fresh worker thread.
pub struct WorkerBackend {
    bridge: HostBridge,
    limits: Limits,
}

impl WorkerBackend {
    pub fn new(bridge: HostBridge, limits: Limits) -> Self {
        Self { bridge, limits }
    }

    fn on_event(
        &self,
        event: WorkerEvent,
        logs: &LogBook,
        guard: &mut WorkerGuard,
        requests: &mut JoinSet<()>,
    ) {
        match event {
            WorkerEvent::Ready(isolate) => guard.arm(isolate),
            WorkerEvent::Log { level, args } => record_log(logs, level, &args),
            WorkerEvent::Request { config, reply } => {
                requests.spawn(forward_request(self.bridge.http().clone(), config, reply));
            }
        }
    }
}

fn record_log(logs: &LogBook, level: LogLevel, args: &str) {
    match wire::decode_args(args, None) {
        Ok(args) => logs.record(level, &args),
        Err(e) => {
            warn!(error = %e, "dropping undecodable worker log arguments");
            logs.record(level, &[BoundaryValue::string(format!("[unserializable: {e}]"))]);
        }
    }
}

fn parse_config(text: &str) -> Result<RequestConfig, String> {
    let value = wire::parse(text).map_err(|e| e.to_string())?;
    let decoded = wire::decode(value, None).map_err(|e| e.to_string())?;
    RequestConfig::from_json(&render(&decoded))
}

/// Perform a worker's request on the host and reply with plain data.
async fn forward_request(http: HttpClient, config: String, reply: oneshot::Sender<String>) {
    let envelope = match parse_config(&config) {
        Ok(config) => match http.settle(config).await {
            Ok(response) => ok_envelope(&make_transferable(response), None),
            Err(reason) => err_envelope(&make_transferable(reason), None),
        },
        Err(message) => err_envelope(&make_transferable(rejection(message)), None),
    };
    if reply.send(envelope).is_err() {
        debug!("worker went away before its request completed");
    }
}

#[async_trait]
impl SandboxBackend for WorkerBackend {
    async fn run(&self, unit: SourceUnit) -> RunResult {
        let limits = self.limits;
        let logs = LogBook::new();
        let setup = json!({
            "mode": "worker",
            "payload": encode_input(&unit.payload),
            "context": encode_input(&unit.context),
        });
        let code = unit.code;
        let started = Instant::now();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        debug!(code_len = code.len(), "starting worker run");
        let spawned = spawn_sandbox("fnbox-worker", move || async move {
            let mut runtime = create_runtime(fnbox_worker::init_ops(), limits.memory_limit_bytes);
            let _ = events_tx.send(WorkerEvent::Ready(runtime.v8_isolate().thread_safe_handle()));
            runtime.op_state().borrow_mut().put(WorkerPort(events_tx));
            drive(runtime, &setup, &code, &limits).await
        });
        let mut report_rx = match spawned {
            Ok(rx) => rx,
            Err(e) => {
                error!(backend = "worker", error = ?e, "failed to start worker");
                return Err(RunFailure::early(e));
            }
        };

        let mut guard = WorkerGuard::default();
        let mut requests = JoinSet::new();
        let deadline = tokio::time::sleep(limits.timeout + limits.worker_grace);
        tokio::pin!(deadline);

        let report = loop {
            tokio::select! {
                report = &mut report_rx => {
                    guard.release();
                    break report.unwrap_or_else(|_| {
                        error!(backend = "worker", "worker thread exited without a report");
                        SandboxReport {
                            result: Err(RunError::infrastructure("worker thread crashed")),
                            accountant: AccountantSnapshot::estimated(started.elapsed()),
                        }
                    });
                }
                Some(event) = events.recv() => {
                    self.on_event(event, &logs, &mut guard, &mut requests);
                }
                _ = &mut deadline => {
                    warn!(
                        backend = "worker",
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "worker exceeded its deadline, terminating"
                    );
                    break SandboxReport {
                        result: Err(RunError::ResourceExceeded(ResourceLimit::Timeout)),
                        accountant: AccountantSnapshot::estimated(started.elapsed()),
                    };
                }
            }
        };

        // Logs posted before settlement may still be queued.
        while let Ok(event) = events.try_recv() {
            if let WorkerEvent::Log { level, args } = event {
                record_log(&logs, level, &args);
            }
        }
        drop(guard);
        requests.abort_all();

        let logs = logs.snapshot();
        info!(
            backend = "worker",
            wall_ms = report.accountant.wall_time_ms,
            logs = logs.len(),
            ok = report.result.is_ok(),
            "worker run settled"
        );
        match report.result {
            Ok(result) => Ok(RunOutput {
                result,
                logs,
                accountant: report.accountant,
            }),
            Err(error) => Err(RunFailure {
                error,
                logs,
                accountant: report.accountant,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "worker"
    }
}
