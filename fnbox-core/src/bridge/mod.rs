//! Host Bridge - the fixed capability set of every run
//!
//! Each run receives exactly three capabilities, passed as parameters of
//! the function that wraps user code:
//! - `global`: the sandbox's own global object
//! - `console`: structured log capture into the run's [`LogBook`]
//! - `request`: mediated outbound HTTP through [`HttpClient`]
//!
//! # Performance-First Design:
//! - One `reqwest::Client` (and its connection pool) is shared by all runs
//! - Capability objects are built per run; nothing leaks between runs

pub mod console;
pub mod request;

pub use console::{LogBook, LogEntry, LogLevel};
pub use request::{HttpClient, HttpResponse, RequestConfig, RequestSettings};

use serde_json::Value;

use crate::boundary::{make_transferable, proxy, wire, BoundaryValue, HandleTable, HostValue};

/// What a capability resolves to inside the sandbox.
#[derive(Debug, Clone)]
pub enum CapabilityValue {
    /// The sandbox's own `globalThis`.
    SelfReference,
    Host(HostValue),
}

/// A named host-provided value exposed to sandboxed code.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: &'static str,
    pub value: CapabilityValue,
    /// Members hidden when the value is an object.
    pub deny: Vec<String>,
}

impl Capability {
    pub fn host(name: &'static str, value: impl Into<HostValue>) -> Self {
        Self {
            name,
            value: CapabilityValue::Host(value.into()),
            deny: Vec::new(),
        }
    }

    /// Classify the capability for the boundary.
    pub fn expose(&self) -> Option<BoundaryValue> {
        match &self.value {
            CapabilityValue::SelfReference => None,
            CapabilityValue::Host(HostValue::Object(object)) if !self.deny.is_empty() => {
                let deny: Vec<&str> = self.deny.iter().map(String::as_str).collect();
                Some(proxy(object, &deny))
            }
            CapabilityValue::Host(value) => Some(make_transferable(value.clone())),
        }
    }

    /// Wire form for a sandbox holding live handles.
    pub fn encode(&self, table: &mut HandleTable) -> Value {
        match self.expose() {
            Some(value) => wire::encode(&value, table),
            None => wire::global_marker(),
        }
    }
}

/// Capabilities of one run plus the log they write to.
pub struct RunCapabilities {
    pub logs: LogBook,
    pub list: Vec<Capability>,
}

/// Builds per-run capabilities around shared host services.
#[derive(Clone)]
pub struct HostBridge {
    http: HttpClient,
}

impl HostBridge {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Fresh capability set with an empty log.
    pub fn capabilities(&self) -> RunCapabilities {
        let logs = LogBook::new();
        let list = vec![
            Capability {
                name: "global",
                value: CapabilityValue::SelfReference,
                deny: Vec::new(),
            },
            Capability::host("console", logs.console()),
            Capability::host("request", self.http.capability()),
        ];
        RunCapabilities { logs, list }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{render, HandleKind, HostObject};
    use serde_json::json;

    #[tokio::test]
    async fn test_exactly_three_capabilities_in_order() {
        let bridge = HostBridge::new(HttpClient::new(RequestSettings::default()).unwrap());
        let caps = bridge.capabilities();
        let names: Vec<_> = caps.list.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["global", "console", "request"]);
        assert!(caps.logs.is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_encode_as_handles() {
        let bridge = HostBridge::new(HttpClient::new(RequestSettings::default()).unwrap());
        let caps = bridge.capabilities();
        let mut table = HandleTable::new();
        let encoded: Vec<Value> = caps.list.iter().map(|c| c.encode(&mut table)).collect();

        assert_eq!(encoded[0], json!({"$fw": "g"}));
        assert_eq!(encoded[1]["log"]["$fw"], "h");
        assert_eq!(encoded[1]["log"]["mode"], "sync");
        assert_eq!(encoded[2]["mode"], "async");
        // console.log, console.warn, console.error, request
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_deny_list_applies_at_expose() {
        let cap = Capability {
            name: "env",
            value: CapabilityValue::Host(HostValue::Object(
                HostObject::new().with("region", "eu").with("token", "secret"),
            )),
            deny: vec!["token".to_string()],
        };
        match cap.expose() {
            Some(BoundaryValue::OpaqueHandle(handle)) => {
                assert_eq!(handle.kind(), HandleKind::Object);
                assert!(handle.get("token").is_undefined());
                assert_eq!(render(&handle.snapshot()), json!({"region": "eu"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
