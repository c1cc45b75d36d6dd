//! Capability proxying - mediated access to live host objects.
//!
//! A sandbox holds handle ids, never host references. Every member read
//! and every call is resolved here, where the deny list is enforced and
//! results are classified again before they cross back.

use std::sync::Arc;

use tracing::trace;

use super::classify::make_transferable;
use super::value::{HostCall, HostObject, HostValue};
use super::{BoundaryValue, Handle, HandleTarget, Structured};

/// Expose `object` as an opaque handle with `deny` members hidden.
///
/// A denied member reads as `undefined` and is absent from the key list;
/// the sandbox cannot tell it apart from a missing member.
pub fn proxy(object: &HostObject, deny: &[&str]) -> BoundaryValue {
    let deny: Vec<String> = deny.iter().map(|key| key.to_string()).collect();
    BoundaryValue::OpaqueHandle(Handle::object(object.clone(), Arc::from(deny)))
}

impl Handle {
    fn visible(&self, key: &str) -> Option<HostValue> {
        match &self.target {
            HandleTarget::Object { object, deny } => {
                if deny.iter().any(|denied| denied == key) {
                    None
                } else {
                    object.get(key)
                }
            }
            HandleTarget::Function(_) => None,
        }
    }

    /// Read one member through the handle.
    pub fn get(&self, key: &str) -> BoundaryValue {
        match self.visible(key) {
            Some(value) => make_transferable(value),
            None => BoundaryValue::undefined(),
        }
    }

    /// Visible member names, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        match &self.target {
            HandleTarget::Object { object, deny } => object
                .keys()
                .into_iter()
                .filter(|key| !deny.iter().any(|denied| denied == key))
                .collect(),
            HandleTarget::Function(_) => Vec::new(),
        }
    }

    /// Invoke the referenced host function.
    pub fn call(&self, args: Vec<HostValue>) -> HostCall {
        match &self.target {
            HandleTarget::Function(function) => function.call(args),
            HandleTarget::Object { .. } => HostCall::Ready(Err(HostValue::string(
                "TypeError: host object is not a function",
            ))),
        }
    }

    /// Copy of the visible members; function members stay handles.
    pub fn snapshot(&self) -> BoundaryValue {
        match &self.target {
            HandleTarget::Object { .. } => BoundaryValue::Structured(Structured::Object(
                self.keys()
                    .into_iter()
                    .map(|key| {
                        let value = self.get(&key);
                        (key, value)
                    })
                    .collect(),
            )),
            HandleTarget::Function(_) => BoundaryValue::OpaqueHandle(self.clone()),
        }
    }
}

/// Drive a host call to completion and classify its outcome.
///
/// `Ok` is the resolved value, `Err` the rejection reason; both are
/// boundary-safe.
pub async fn settle(call: HostCall) -> Result<BoundaryValue, BoundaryValue> {
    let outcome = match call {
        HostCall::Ready(outcome) => outcome,
        HostCall::Pending(future) => future.await,
    };
    outcome.map(make_transferable).map_err(make_transferable)
}

/// Per-run registry of handles the sandbox has been given.
///
/// Ids are dense indices; a handle lives until the run ends.
#[derive(Default)]
pub struct HandleTable {
    handles: Vec<Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle and return its id. Re-registering the same target
    /// with the same deny list returns the existing id, so identity is
    /// stable inside the sandbox. A different deny list gets its own id.
    pub fn register(&mut self, handle: Handle) -> u32 {
        if let Some(pos) = self.handles.iter().position(|known| known.same_as(&handle)) {
            return pos as u32;
        }
        self.handles.push(handle);
        let id = (self.handles.len() - 1) as u32;
        trace!(handle_id = id, "registered handle");
        id
    }

    pub fn get(&self, id: u32) -> Option<&Handle> {
        self.handles.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{render, HandleKind, HostFunction};
    use serde_json::json;

    fn response() -> HostObject {
        HostObject::proxied(&["clone"])
            .with("status", 200.0)
            .with("clone", HostFunction::sync(|_| Ok(HostValue::Null)))
    }

    #[test]
    fn test_denied_member_reads_undefined() {
        let handle = Handle::object(HostObject::new().with("secret", "x"), Arc::from(vec!["secret".to_string()]));
        assert!(handle.get("secret").is_undefined());
        assert!(handle.keys().is_empty());
    }

    #[test]
    fn test_proxy_builds_object_handle() {
        let obj = HostObject::new().with("a", 1.0).with("b", 2.0);
        match proxy(&obj, &["b"]) {
            BoundaryValue::OpaqueHandle(handle) => {
                assert_eq!(handle.kind(), HandleKind::Object);
                assert_eq!(handle.keys(), vec!["a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_live_handle_sees_later_mutation() {
        let obj = response();
        let handle = match make_transferable(HostValue::Object(obj.clone())) {
            BoundaryValue::OpaqueHandle(handle) => handle,
            other => panic!("unexpected {other:?}"),
        };
        obj.set("status", 404.0);
        assert_eq!(render(&handle.get("status")), json!(404));
        assert!(handle.get("clone").is_undefined());
    }

    #[test]
    fn test_snapshot_hides_denied_members() {
        let handle = Handle::object(response(), Arc::from(vec!["clone".to_string()]));
        assert_eq!(render(&handle.snapshot()), json!({"status": 200}));
    }

    #[tokio::test]
    async fn test_settle_classifies_both_outcomes() {
        let ok = Handle::function(HostFunction::sync(|_| {
            Ok(HostValue::Object(HostObject::new().with("x", 1.0)))
        }));
        let resolved = settle(ok.call(vec![])).await.unwrap();
        assert_eq!(render(&resolved), json!({"x": 1}));

        let failing = Handle::function(HostFunction::asynchronous(|_| async {
            Err(HostValue::string("nope"))
        }));
        let rejected = settle(failing.call(vec![])).await.unwrap_err();
        assert_eq!(rejected.as_str(), Some("nope"));
    }

    #[tokio::test]
    async fn test_calling_object_handle_rejects() {
        let handle = Handle::object(HostObject::new(), Arc::from(Vec::<String>::new()));
        assert!(settle(handle.call(vec![])).await.is_err());
    }

    #[test]
    fn test_handle_table_reuses_ids_for_same_target() {
        let f = HostFunction::sync(|_| Ok(HostValue::Null));
        let mut table = HandleTable::new();
        let a = table.register(Handle::function(f.clone()));
        let b = table.register(Handle::function(f));
        let c = table.register(Handle::function(HostFunction::sync(|_| Ok(HostValue::Null))));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_handle_table_separates_deny_lists() {
        let obj = HostObject::new().with("region", "eu").with("token", "secret");
        let mut table = HandleTable::new();
        let open = table.register(Handle::object(obj.clone(), Arc::from(Vec::<String>::new())));
        let guarded = table.register(Handle::object(obj.clone(), Arc::from(vec!["token".to_string()])));
        let again = table.register(Handle::object(obj, Arc::from(vec!["token".to_string()])));

        assert_ne!(open, guarded);
        assert_eq!(guarded, again);
        let handle = table.get(guarded).unwrap();
        assert!(handle.get("token").is_undefined());
        assert_eq!(handle.keys(), vec!["region"]);
        assert_eq!(table.get(open).unwrap().get("token").as_str(), Some("secret"));
    }
}
