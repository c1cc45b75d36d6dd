//! Host-side values that may be offered to a sandbox.
//!
//! `HostValue` is the host's view of anything a capability can hold or
//! return: plain data, shared mutable objects, callable functions, lazily
//! iterated collections and event emitters. None of these ever enter a
//! sandbox directly; they are first turned into a
//! [`BoundaryValue`](super::BoundaryValue) by the classifier.

use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use super::Handle;

/// Outcome of a host function: `Ok` resolves, `Err` rejects with a value.
pub type HostResult = Result<HostValue, HostValue>;

type SyncFn = dyn Fn(Vec<HostValue>) -> HostResult + Send + Sync;
type AsyncFn = dyn Fn(Vec<HostValue>) -> BoxFuture<'static, HostResult> + Send + Sync;
type IterFactory = dyn Fn() -> Box<dyn Iterator<Item = HostValue> + Send> + Send + Sync;

/// A value living on the host side of the isolation boundary.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<HostValue>),
    Object(HostObject),
    Function(HostFunction),
    Iterable(HostIterable),
    Emitter(EventEmitter),
    /// A value that already went through the boundary once.
    Handle(Handle),
}

impl HostValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => f.debug_list().entries(items).finish(),
            Self::Object(obj) => obj.fmt(f),
            Self::Function(func) => func.fmt(f),
            Self::Iterable(_) => write!(f, "[Iterable]"),
            Self::Emitter(_) => write!(f, "[EventEmitter]"),
            Self::Handle(handle) => handle.fmt(f),
        }
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(HostObject::from_entries(
                map.into_iter().map(|(key, value)| (key, Self::from(value))),
            )),
        }
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<HostObject> for HostValue {
    fn from(value: HostObject) -> Self {
        Self::Object(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        Self::Function(value)
    }
}

/// How an object crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    /// Deep-copied; the sandbox owns an independent structure.
    Copy,
    /// Exposed as a live object handle; `deny` members read as `undefined`.
    Proxy { deny: Arc<[String]> },
}

type Entries = IndexMap<String, HostValue>;

struct ObjectInner {
    entries: RwLock<Entries>,
    exposure: Exposure,
}

/// A shared, mutable, insertion-ordered host object.
///
/// Clones share the same underlying storage, so mutations made after a
/// value was handed to the boundary are visible to live handles but never
/// to copies taken earlier.
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<ObjectInner>,
}

impl HostObject {
    /// An object that crosses the boundary as a deep copy.
    pub fn new() -> Self {
        Self::with_exposure(Exposure::Copy)
    }

    /// An object that crosses the boundary as a handle hiding `deny`.
    pub fn proxied(deny: &[&str]) -> Self {
        let deny: Vec<String> = deny.iter().map(|k| k.to_string()).collect();
        Self::with_exposure(Exposure::Proxy { deny: deny.into() })
    }

    /// A copy-exposed object holding `entries`. A repeated key keeps its
    /// first position and its last value.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, HostValue)>) -> Self {
        Self::build(entries.into_iter().collect(), Exposure::Copy)
    }

    fn with_exposure(exposure: Exposure) -> Self {
        Self::build(Entries::new(), exposure)
    }

    fn build(entries: Entries, exposure: Exposure) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                entries: RwLock::new(entries),
                exposure,
            }),
        }
    }

    /// Builder-style insert.
    pub fn with(self, key: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace `key`, keeping the original position on replace.
    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        let key = key.into();
        let value = value.into();
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Point-in-time copy of the entry list (values are shallow clones).
    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn exposure(&self) -> &Exposure {
        &self.inner.exposure
    }

    /// Identity of the shared storage, used for cycle detection.
    pub fn ptr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for HostObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys only: values may be cyclic.
        f.debug_struct("HostObject")
            .field("keys", &self.keys())
            .field("exposure", self.exposure())
            .finish()
    }
}

/// What calling a [`HostFunction`] produced.
pub enum HostCall {
    Ready(HostResult),
    Pending(BoxFuture<'static, HostResult>),
}

/// A host function reachable from the sandbox through a handle.
#[derive(Clone)]
pub enum HostFunction {
    /// Runs to completion inside the calling op.
    Sync(Arc<SyncFn>),
    /// Awaited host-side; the sandbox sees a promise.
    Async(Arc<AsyncFn>),
}

impl HostFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> HostResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HostResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn call(&self, args: Vec<HostValue>) -> HostCall {
        match self {
            Self::Sync(f) => HostCall::Ready(f(args)),
            Self::Async(f) => HostCall::Pending(f(args)),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    pub fn ptr(&self) -> usize {
        match self {
            Self::Sync(f) => Arc::as_ptr(f) as *const () as usize,
            Self::Async(f) => Arc::as_ptr(f) as *const () as usize,
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            write!(f, "[AsyncFunction]")
        } else {
            write!(f, "[Function]")
        }
    }
}

/// A non-array collection that is only reachable through its iterator.
///
/// Materialization drains a fresh iterator each time; an endless iterator
/// never finishes.
#[derive(Clone)]
pub struct HostIterable {
    factory: Arc<IterFactory>,
}

impl HostIterable {
    pub fn new<F, I>(factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Iterator<Item = HostValue> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || Box::new(factory())),
        }
    }

    pub fn materialize(&self) -> Vec<HostValue> {
        (self.factory)().collect()
    }
}

/// A host event bus. It never crosses the boundary as anything but `{}`.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<HashMap<String, Vec<HostFunction>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, listener: HostFunction) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event.into())
            .or_default()
            .push(listener);
    }

    /// Invoke synchronous listeners for `event`; returns how many ran.
    pub fn emit(&self, event: &str, args: Vec<HostValue>) -> usize {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event)
            .cloned()
            .unwrap_or_default();
        let mut ran = 0;
        for listener in listeners {
            if let HostCall::Ready(_) = listener.call(args.clone()) {
                ran += 1;
            }
        }
        ran
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_set_replaces_in_place() {
        let obj = HostObject::new().with("a", 1.0).with("b", 2.0);
        obj.set("a", 3.0);
        assert_eq!(obj.keys(), vec!["a", "b"]);
        assert_eq!(obj.get("a").and_then(|v| v.as_f64()), Some(3.0));
    }

    #[test]
    fn test_object_clones_share_storage() {
        let obj = HostObject::new();
        let alias = obj.clone();
        alias.set("k", "v");
        assert_eq!(obj.get("k").and_then(|v| v.as_str().map(String::from)), Some("v".into()));
        assert_eq!(obj.ptr(), alias.ptr());
    }

    #[test]
    fn test_proxied_exposure_records_deny_list() {
        let obj = HostObject::proxied(&["clone"]);
        match obj.exposure() {
            Exposure::Proxy { deny } => assert_eq!(&deny[..], &["clone".to_string()]),
            Exposure::Copy => panic!("expected proxy exposure"),
        }
    }

    #[test]
    fn test_from_json_preserves_order() {
        let value = HostValue::from(json!({"z": 1, "a": [true, null]}));
        match value {
            HostValue::Object(obj) => assert_eq!(obj.keys(), vec!["z", "a"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wide_json_object_converts_in_linear_time() {
        let wide: serde_json::Map<String, serde_json::Value> =
            (0..100_000).map(|i| (format!("k{i}"), json!(i))).collect();
        let start = std::time::Instant::now();
        let value = HostValue::from(serde_json::Value::Object(wide));
        let elapsed = start.elapsed();
        let HostValue::Object(obj) = value else {
            panic!("expected object");
        };
        assert_eq!(obj.len(), 100_000);
        assert_eq!(obj.get("k99999").and_then(|v| v.as_f64()), Some(99_999.0));
        assert!(elapsed < std::time::Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn test_from_entries_keeps_first_position() {
        let obj = HostObject::from_entries(vec![
            ("a".to_string(), HostValue::Number(1.0)),
            ("b".to_string(), HostValue::Number(2.0)),
            ("a".to_string(), HostValue::Number(3.0)),
        ]);
        assert_eq!(obj.keys(), vec!["a", "b"]);
        assert_eq!(obj.get("a").and_then(|v| v.as_f64()), Some(3.0));
    }

    #[test]
    fn test_iterable_materializes_in_order() {
        let iterable = HostIterable::new(|| (1..=3).map(|n| HostValue::Number(n as f64)));
        let items: Vec<f64> = iterable
            .materialize()
            .iter()
            .filter_map(HostValue::as_f64)
            .collect();
        assert_eq!(items, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_emitter_runs_sync_listeners() {
        let emitter = EventEmitter::new();
        emitter.on("tick", HostFunction::sync(|_| Ok(HostValue::Undefined)));
        assert_eq!(emitter.listener_count("tick"), 1);
        assert_eq!(emitter.emit("tick", vec![]), 1);
        assert_eq!(emitter.emit("other", vec![]), 0);
    }

    #[tokio::test]
    async fn test_async_function_is_pending() {
        let f = HostFunction::asynchronous(|args: Vec<HostValue>| async move {
            Ok(HostValue::Number(args.len() as f64))
        });
        assert!(f.is_async());
        match f.call(vec![HostValue::Null, HostValue::Null]) {
            HostCall::Pending(fut) => {
                let out = fut.await.unwrap();
                assert_eq!(out.as_f64(), Some(2.0));
            }
            HostCall::Ready(_) => panic!("expected pending call"),
        }
    }
}
