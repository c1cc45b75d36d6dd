//! V8 sandbox driver shared by both backends.
//!
//! V8 isolates are `!Send`, so every run owns a dedicated OS thread with a
//! current-thread tokio runtime. The driver installs the heap and timeout
//! guards, evaluates the prelude and the wrapped user code, pumps the event
//! loop and interprets the settlement.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::{v8, JsRuntime, ModuleCodeString, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::accountant::{AccountantSnapshot, ExecutionAccountant};
use crate::boundary::{render, wire, HandleTable};
use crate::error::{ResourceLimit, RunError};

use super::ops::SettleSlot;
use super::resource_limits::Limits;

const PRELUDE: &str = include_str!("prelude.js");

/// Diagnostic result when user code defines no entry function.
pub const NO_ENTRY: &str = "No fetch function defined";

/// What one sandbox thread reports back.
#[derive(Debug)]
pub(crate) struct SandboxReport {
    pub result: Result<Value, RunError>,
    pub accountant: AccountantSnapshot,
}

impl SandboxReport {
    pub fn failed(error: RunError) -> Self {
        Self {
            result: Err(error),
            accountant: AccountantSnapshot::zero(),
        }
    }
}

/// Wrap user code so capabilities arrive as parameters. A top-level
/// `return` short-circuits the entry call.
pub(crate) fn wrap_source(code: &str) -> String {
    format!(
        "globalThis.__fwEnter(async (global, console, request, payload, context) => {{\n\
         {code}\n\
         ;if (typeof fetch === 'function') return await fetch(payload, context);\n\
         return {NO_ENTRY:?};\n\
         }});"
    )
}

/// Run `job` on a fresh thread that owns its own single-threaded runtime.
pub(crate) fn spawn_sandbox<F, Fut>(
    name: &str,
    job: F,
) -> Result<oneshot::Receiver<SandboxReport>, RunError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = SandboxReport>,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let report = SandboxReport::failed(RunError::infrastructure(e.to_string()));
                    if tx.send(report).is_err() {
                        warn!("sandbox report receiver dropped");
                    }
                    return;
                }
            };
            let report = rt.block_on(job());
            if tx.send(report).is_err() {
                warn!("sandbox report receiver dropped before the run settled");
            }
        })
        .map_err(|e| RunError::infrastructure(format!("failed to spawn sandbox thread: {e}")))?;
    Ok(rx)
}

/// Fresh runtime with a heap ceiling and the given ops.
pub(crate) fn create_runtime(extension: deno_core::Extension, memory_limit_bytes: u64) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, memory_limit_bytes as usize);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![extension],
        create_params: Some(create_params),
        ..Default::default()
    })
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points into the Box owned by the HeapGuard, which the
    // driver keeps alive until after the runtime is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    // Headroom for the termination to unwind.
    current_heap_limit + 1024 * 1024
}

/// Terminates execution when V8 nears its heap ceiling.
struct HeapGuard {
    state: Box<HeapLimitState>,
}

impl HeapGuard {
    fn install(runtime: &mut JsRuntime) -> Self {
        let state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        Self { state }
    }

    fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }
}

/// Terminates execution once the wall-clock budget is spent.
pub(crate) struct TimeoutGuard {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl TimeoutGuard {
    pub fn spawn(handle: v8::IsolateHandle, timeout: Duration) -> io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let thread = std::thread::Builder::new()
            .name("fnbox-watchdog".to_string())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    flag.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            })?;
        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
            fired,
        })
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop the watchdog and wait for it to exit.
    pub fn disarm(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn used_heap_bytes(runtime: &mut JsRuntime) -> u64 {
    let mut stats = v8::HeapStatistics::default();
    runtime.v8_isolate().get_heap_statistics(&mut stats);
    stats.used_heap_size() as u64
}

fn first_line(message: &str) -> String {
    let line = message.lines().next().unwrap_or(message);
    line.strip_prefix("Uncaught ").unwrap_or(line).to_string()
}

/// Evaluate the prelude with `setup`, run `code` and collect the outcome.
///
/// The runtime is consumed and dropped before the heap guard, so the
/// near-heap-limit callback never outlives its state.
pub(crate) async fn drive(mut runtime: JsRuntime, setup: &Value, code: &str, limits: &Limits) -> SandboxReport {
    let heap = HeapGuard::install(&mut runtime);
    let mut watchdog = match TimeoutGuard::spawn(runtime.v8_isolate().thread_safe_handle(), limits.timeout) {
        Ok(watchdog) => watchdog,
        Err(e) => {
            drop(runtime);
            return SandboxReport::failed(RunError::infrastructure(format!(
                "failed to spawn watchdog: {e}"
            )));
        }
    };

    let report = drive_inner(&mut runtime, &heap, &mut watchdog, setup, code, limits).await;

    watchdog.disarm();
    drop(runtime);
    drop(heap);
    report
}

async fn drive_inner(
    runtime: &mut JsRuntime,
    heap: &HeapGuard,
    watchdog: &mut TimeoutGuard,
    setup: &Value,
    code: &str,
    limits: &Limits,
) -> SandboxReport {
    let bootstrap = format!("({PRELUDE})(Deno.core.ops, {setup});");
    if let Err(e) = runtime.execute_script("[fnbox:prelude]", ModuleCodeString::from(bootstrap)) {
        return SandboxReport::failed(RunError::infrastructure(format!("prelude failed: {e}")));
    }

    let accountant = ExecutionAccountant::start();
    let limit_hit = |heap: &HeapGuard, watchdog: &TimeoutGuard| {
        if heap.triggered() {
            Some(RunError::ResourceExceeded(ResourceLimit::Memory))
        } else if watchdog.fired() {
            Some(RunError::ResourceExceeded(ResourceLimit::Timeout))
        } else {
            None
        }
    };

    if let Err(e) = runtime.execute_script("[fnbox:worker]", ModuleCodeString::from(wrap_source(code))) {
        if let Some(limit) = limit_hit(heap, watchdog) {
            let heap_used = used_heap_bytes(runtime);
            return SandboxReport {
                result: Err(limit),
                accountant: accountant.finish(heap_used),
            };
        }
        debug!(error = %e, "user code failed to compile");
        return SandboxReport::failed(RunError::compile(first_line(&e.to_string())));
    }

    let loop_error = match tokio::time::timeout(
        limits.timeout,
        runtime.run_event_loop(PollEventLoopOptions::default()),
    )
    .await
    {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(RunError::runtime(first_line(&e.to_string()))),
        Err(_) => Some(RunError::ResourceExceeded(ResourceLimit::Timeout)),
    };
    watchdog.disarm();

    let heap_used = used_heap_bytes(runtime);
    let accountant = accountant.finish(heap_used);

    if let Some(limit) = limit_hit(heap, watchdog) {
        return SandboxReport {
            result: Err(limit),
            accountant,
        };
    }

    let settled = runtime
        .op_state()
        .borrow_mut()
        .try_take::<SettleSlot>()
        .and_then(|slot| slot.0);
    let result = match (settled, loop_error) {
        (Some(outcome), _) => {
            let state = runtime.op_state();
            let state = state.borrow();
            interpret(&outcome, state.try_borrow::<HandleTable>())
        }
        (None, Some(error)) => Err(error),
        (None, None) => Err(RunError::runtime("Error: entry promise never settled")),
    };
    SandboxReport { result, accountant }
}

/// Turn a settlement envelope into the run's result.
fn interpret(outcome: &str, table: Option<&HandleTable>) -> Result<Value, RunError> {
    let mut envelope = match wire::parse(outcome) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(RunError::infrastructure("settlement is not an object")),
        Err(e) => return Err(RunError::runtime(format!("Error: result could not be transferred ({e})"))),
    };
    if let Some(message) = envelope.remove("message") {
        let message = match message {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(RunError::runtime(message));
    }
    let value = envelope.remove("ok").unwrap_or(Value::Null);
    wire::decode(value, table)
        .map(|decoded| render(&decoded))
        .map_err(|e| RunError::runtime(format!("Error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrap_source_passes_capabilities_as_parameters() {
        let wrapped = wrap_source("return 1 + 1");
        assert!(wrapped.starts_with("globalThis.__fwEnter(async (global, console, request, payload, context) => {"));
        assert!(wrapped.contains("\nreturn 1 + 1\n"));
        assert!(wrapped.contains("return \"No fetch function defined\";"));
    }

    #[test]
    fn test_interpret_success() {
        let value = interpret(r#"{"ok":{"a":[1,{"$fw":"u"}]}}"#, None).unwrap();
        assert_eq!(value, json!({"a": [1, null]}));
    }

    #[test]
    fn test_interpret_failure_uses_message() {
        let err = interpret(r#"{"err":{"message":"x"},"message":"Error: boom"}"#, None).unwrap_err();
        assert_eq!(err, RunError::runtime("Error: boom"));
    }

    #[test]
    fn test_interpret_rejects_unknown_handles() {
        let err = interpret(r#"{"ok":{"$fw":"h","id":9}}"#, None).unwrap_err();
        assert_eq!(err.kind(), "runtime");
    }

    #[test]
    fn test_first_line_strips_uncaught_prefix() {
        assert_eq!(
            first_line("Uncaught SyntaxError: Unexpected token\n    at [fnbox:worker]:2:3"),
            "SyntaxError: Unexpected token"
        );
    }
}
