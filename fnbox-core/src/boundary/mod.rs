//! Boundary Value Model - what may cross into and out of a sandbox
//!
//! Host values never enter a sandbox directly. They are classified and,
//! when necessary, copied into a [`BoundaryValue`]: a finite tree of
//! primitives, structured data and opaque handles. Handles are the only way
//! a sandbox can reach live host state, and every access through one is
//! mediated by [`proxy`].
//!
//! # Performance-First Design:
//! - Copying is iterative (explicit worklist), so hostile nesting depth
//!   cannot exhaust the host stack.
//! - Handles are `Arc` clones; exposing a capability never deep-copies it.

pub mod classify;
pub mod proxy;
pub mod value;
pub mod wire;

pub use classify::{classify, into_host, make_transferable, render, Transfer};
pub use proxy::{proxy, settle, HandleTable};
pub use value::{
    EventEmitter, Exposure, HostCall, HostFunction, HostIterable, HostObject, HostResult,
    HostValue,
};

use std::fmt;
use std::sync::Arc;

/// Marker substituted for a reference back to an ancestor.
pub const CIRCULAR: &str = "[Circular]";

/// A value that is allowed to cross the isolation boundary.
#[derive(Debug, Clone)]
pub enum BoundaryValue {
    Primitive(Primitive),
    Structured(Structured),
    OpaqueHandle(Handle),
}

impl BoundaryValue {
    pub fn undefined() -> Self {
        Self::Primitive(Primitive::Undefined)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Primitive(Primitive::String(value.into()))
    }

    pub fn empty_object() -> Self {
        Self::Structured(Structured::Object(Vec::new()))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Primitive(Primitive::Undefined))
    }

    /// Member lookup on a structured object (handles are not traversed).
    pub fn field(&self, key: &str) -> Option<&BoundaryValue> {
        match self {
            Self::Structured(Structured::Object(entries)) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Primitive(Primitive::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// Scalars, copied by value.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// Plain data owned by whichever side received it.
#[derive(Debug, Clone)]
pub enum Structured {
    Array(Vec<BoundaryValue>),
    /// Insertion-ordered members.
    Object(Vec<(String, BoundaryValue)>),
}

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Function,
    Object,
}

#[derive(Clone)]
pub(crate) enum HandleTarget {
    Function(HostFunction),
    Object {
        object: HostObject,
        deny: Arc<[String]>,
    },
}

/// A non-copyable reference to a live host function or object.
///
/// The sandbox only ever sees an id; every operation on it goes back to
/// the host, where the deny list is enforced.
#[derive(Clone)]
pub struct Handle {
    pub(crate) target: HandleTarget,
}

impl Handle {
    pub fn function(function: HostFunction) -> Self {
        Self {
            target: HandleTarget::Function(function),
        }
    }

    pub fn object(object: HostObject, deny: Arc<[String]>) -> Self {
        Self {
            target: HandleTarget::Object { object, deny },
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self.target {
            HandleTarget::Function(_) => HandleKind::Function,
            HandleTarget::Object { .. } => HandleKind::Object,
        }
    }

    /// Whether calls through this handle settle asynchronously.
    pub fn is_async(&self) -> bool {
        match &self.target {
            HandleTarget::Function(f) => f.is_async(),
            HandleTarget::Object { .. } => false,
        }
    }

    /// Identity of the referenced host value.
    pub fn ptr(&self) -> usize {
        match &self.target {
            HandleTarget::Function(f) => f.ptr(),
            HandleTarget::Object { object, .. } => object.ptr(),
        }
    }

    /// Same host target seen through the same deny list.
    pub fn same_as(&self, other: &Handle) -> bool {
        match (&self.target, &other.target) {
            (HandleTarget::Function(a), HandleTarget::Function(b)) => a.ptr() == b.ptr(),
            (
                HandleTarget::Object { object: a, deny: deny_a },
                HandleTarget::Object { object: b, deny: deny_b },
            ) => a.ptr() == b.ptr() && deny_a == deny_b,
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            HandleTarget::Function(func) => write!(f, "Handle({func:?})"),
            HandleTarget::Object { object, deny } => f
                .debug_struct("Handle")
                .field("keys", &object.keys())
                .field("deny", deny)
                .finish(),
        }
    }
}
