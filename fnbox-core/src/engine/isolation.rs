//! In-Process Isolate Backend
//!
//! Each run gets a brand-new V8 isolate with a heap ceiling and a single
//! context, on its own thread. Capabilities are live host handles: console
//! calls append straight to the run's log and `request` calls are awaited
//! on the host runtime, with results re-classified on the way back.
//!
//! # Performance-First Design:
//! - The isolate thread's CPU clock gives exact per-run CPU time
//! - Host handles are `Arc` clones; nothing is copied until it is read

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::boundary::{make_transferable, wire, HandleTable, HostValue};
use crate::bridge::HostBridge;
use crate::error::RunError;
use crate::executor::{RunFailure, RunOutput, RunResult, SandboxBackend, SourceUnit};

use super::js::{create_runtime, drive, spawn_sandbox, SandboxReport};
use super::ops::fnbox_isolate;
use super::resource_limits::Limits;

/// Wire form of a plain JSON input.
pub(crate) fn encode_input(value: &Value) -> Value {
    wire::encode_detached(&make_transferable(HostValue::from(value.clone())))
}

/// Runs every source unit in a fresh in-process isolate.
pub struct IsolateBackend {
    bridge: HostBridge,
    limits: Limits,
}

impl IsolateBackend {
    pub fn new(bridge: HostBridge, limits: Limits) -> Self {
        Self { bridge, limits }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    async fn run(&self, unit: SourceUnit) -> RunResult {
        let capabilities = self.bridge.capabilities();
        let logs = capabilities.logs.clone();
        let list = capabilities.list;
        let limits = self.limits;
        let payload = encode_input(&unit.payload);
        let context = encode_input(&unit.context);
        let code = unit.code;

        debug!(code_len = code.len(), "starting isolate run");
        let receiver = spawn_sandbox("fnbox-isolate", move || async move {
            let mut runtime = create_runtime(fnbox_isolate::init_ops(), limits.memory_limit_bytes);
            let mut table = HandleTable::new();
            let capabilities: Vec<Value> = list.iter().map(|cap| cap.encode(&mut table)).collect();
            runtime.op_state().borrow_mut().put(table);
            let setup = json!({
                "mode": "isolate",
                "capabilities": capabilities,
                "payload": payload,
                "context": context,
            });
            drive(runtime, &setup, &code, &limits).await
        });

        let report = match receiver {
            Ok(receiver) => receiver.await.unwrap_or_else(|_| {
                SandboxReport::failed(RunError::infrastructure("isolate thread exited without a report"))
            }),
            Err(e) => SandboxReport::failed(e),
        };

        if let Err(RunError::Infrastructure { message }) = &report.result {
            error!(backend = "isolate", error = %message, "sandbox infrastructure failure");
        }

        let logs = logs.snapshot();
        info!(
            backend = "isolate",
            wall_ms = report.accountant.wall_time_ms,
            logs = logs.len(),
            ok = report.result.is_ok(),
            "isolate run settled"
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
        "isolate"
    }
}
