//! V8 ops exposed to the sandbox prelude.
//!
//! All values cross as JSON envelope text: `{"ok": <wire>}` or
//! `{"err": <wire>}`. Ops never throw into the sandbox themselves; the
//! prelude turns an `err` envelope into a rejection.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::{op2, v8, OpState};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::boundary::{
    into_host, make_transferable, settle, wire, BoundaryValue, Handle, HandleTable, HostCall,
    HostValue,
};
use crate::bridge::LogLevel;

/// Outcome text posted by the prelude once the user function settles.
#[derive(Default)]
pub(crate) struct SettleSlot(pub Option<String>);

#[derive(Deserialize)]
pub(crate) struct Settlement {
    outcome: String,
}

/// Messages a worker sandbox sends to its parent.
pub(crate) enum WorkerEvent {
    Ready(v8::IsolateHandle),
    Log {
        level: LogLevel,
        args: String,
    },
    Request {
        config: String,
        reply: oneshot::Sender<String>,
    },
}

/// Worker-side end of the parent channel.
pub(crate) struct WorkerPort(pub mpsc::UnboundedSender<WorkerEvent>);

#[derive(Deserialize)]
pub(crate) struct WorkerLog {
    level: String,
    args: String,
}

pub(crate) fn ok_envelope(value: &BoundaryValue, table: Option<&mut HandleTable>) -> String {
    let encoded = match table {
        Some(table) => wire::encode(value, table),
        None => wire::encode_detached(value),
    };
    json!({ "ok": encoded }).to_string()
}

pub(crate) fn err_envelope(reason: &BoundaryValue, table: Option<&mut HandleTable>) -> String {
    let encoded = match table {
        Some(table) => wire::encode(reason, table),
        None => wire::encode_detached(reason),
    };
    json!({ "err": encoded }).to_string()
}

fn type_error(message: &str) -> String {
    err_envelope(&BoundaryValue::string(format!("TypeError: {message}")), None)
}

#[op2]
pub(crate) fn op_fw_settle(state: &mut OpState, #[serde] settlement: Settlement) {
    state.put(SettleSlot(Some(settlement.outcome)));
}

#[op2]
#[string]
pub(crate) fn op_fw_get(state: &mut OpState, id: u32, #[string] key: String) -> String {
    let table = state.borrow_mut::<HandleTable>();
    let value = table
        .get(id)
        .map(|handle| handle.get(&key))
        .unwrap_or_else(BoundaryValue::undefined);
    ok_envelope(&value, Some(table))
}

#[op2]
#[string]
pub(crate) fn op_fw_keys(state: &mut OpState, id: u32) -> String {
    let table = state.borrow::<HandleTable>();
    let keys = table.get(id).map(Handle::keys).unwrap_or_default();
    serde_json::Value::from(keys).to_string()
}

/// Resolve the handle and decode arguments, or produce the error envelope.
fn prepare_call(
    table: &HandleTable,
    id: u32,
    args: &str,
) -> Result<(Handle, Vec<HostValue>), String> {
    let handle = table
        .get(id)
        .cloned()
        .ok_or_else(|| type_error("stale host handle"))?;
    let args = wire::decode_args(args, Some(table)).map_err(|e| type_error(&e.to_string()))?;
    Ok((handle, args.into_iter().map(into_host).collect()))
}

#[op2]
#[string]
pub(crate) fn op_fw_call(state: &mut OpState, id: u32, #[string] args: String) -> String {
    let table = state.borrow_mut::<HandleTable>();
    let (handle, args) = match prepare_call(table, id, &args) {
        Ok(prepared) => prepared,
        Err(envelope) => return envelope,
    };
    match handle.call(args) {
        HostCall::Ready(Ok(value)) => ok_envelope(&make_transferable(value), Some(table)),
        HostCall::Ready(Err(reason)) => err_envelope(&make_transferable(reason), Some(table)),
        HostCall::Pending(_) => type_error("asynchronous host function called synchronously"),
    }
}

#[op2(async)]
#[string]
pub(crate) async fn op_fw_call_async(
    state: Rc<RefCell<OpState>>,
    id: u32,
    #[string] args: String,
) -> String {
    let call = {
        let state = state.borrow();
        match prepare_call(state.borrow::<HandleTable>(), id, &args) {
            Ok((handle, args)) => handle.call(args),
            Err(envelope) => return envelope,
        }
    };
    let outcome = settle(call).await;
    let mut state = state.borrow_mut();
    let table = state.borrow_mut::<HandleTable>();
    match outcome {
        Ok(value) => ok_envelope(&value, Some(table)),
        Err(reason) => err_envelope(&reason, Some(table)),
    }
}

#[op2]
pub(crate) fn op_fw_worker_log(state: &mut OpState, #[serde] entry: WorkerLog) {
    let level = LogLevel::parse(&entry.level).unwrap_or(LogLevel::Log);
    let port = state.borrow::<WorkerPort>();
    // A closed port means the parent already gave up on this run.
    let _ = port.0.send(WorkerEvent::Log {
        level,
        args: entry.args,
    });
}

#[op2(async)]
#[string]
pub(crate) async fn op_fw_worker_request(
    state: Rc<RefCell<OpState>>,
    #[string] config: String,
) -> String {
    let (reply, response) = oneshot::channel();
    let sent = state
        .borrow()
        .borrow::<WorkerPort>()
        .0
        .send(WorkerEvent::Request { config, reply });
    let detached = || err_envelope(&BoundaryValue::string("Error: worker detached"), None);
    if sent.is_err() {
        return detached();
    }
    response.await.unwrap_or_else(|_| detached())
}

deno_core::extension!(
    fnbox_isolate,
    ops = [op_fw_settle, op_fw_get, op_fw_keys, op_fw_call, op_fw_call_async]
);

deno_core::extension!(
    fnbox_worker,
    ops = [op_fw_settle, op_fw_worker_log, op_fw_worker_request]
);
