//! Transfer classification and boundary copying.
//!
//! [`make_transferable`] is the single place where host data is deep-copied
//! for a sandbox. Traversal uses an explicit worklist plus an ancestor path,
//! so a reference back to an ancestor becomes [`CIRCULAR`] while a node
//! shared by two siblings (a DAG) is copied at each occurrence.

use std::rc::Rc;

use serde_json::{Map, Number, Value};

use super::value::{Exposure, HostObject, HostValue};
use super::{BoundaryValue, Handle, HandleKind, Primitive, Structured, CIRCULAR};

/// Whether a host value can cross as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Primitives and existing handles.
    Transferable,
    /// Anything that must be copied or wrapped first.
    NeedsCopy,
}

pub fn classify(value: &HostValue) -> Transfer {
    match value {
        HostValue::Undefined
        | HostValue::Null
        | HostValue::Bool(_)
        | HostValue::Number(_)
        | HostValue::String(_)
        | HostValue::Handle(_) => Transfer::Transferable,
        _ => Transfer::NeedsCopy,
    }
}

/// Ancestor chain of copied objects, shared between siblings.
struct PathNode {
    ptr: usize,
    parent: Option<Rc<PathNode>>,
}

fn on_path(mut path: Option<&Rc<PathNode>>, ptr: usize) -> bool {
    while let Some(node) = path {
        if node.ptr == ptr {
            return true;
        }
        path = node.parent.as_ref();
    }
    false
}

enum Slot<T> {
    Done(T),
    Array(Vec<usize>),
    Object(Vec<(String, usize)>),
}

/// Fill a tree of slots bottom-up. Children are always allocated after
/// their parent, so walking the slots in reverse sees every child first.
fn assemble<T>(
    slots: Vec<Option<Slot<T>>>,
    array: impl Fn(Vec<T>) -> T,
    object: impl Fn(Vec<(String, T)>) -> T,
    empty: impl Fn() -> T,
) -> T {
    let mut built: Vec<Option<T>> = Vec::with_capacity(slots.len());
    built.resize_with(slots.len(), || None);
    let take = |built: &mut Vec<Option<T>>, idx: usize| {
        built.get_mut(idx).and_then(Option::take).unwrap_or_else(&empty)
    };
    for (idx, slot) in slots.into_iter().enumerate().rev() {
        let value = match slot {
            Some(Slot::Done(value)) => value,
            Some(Slot::Array(children)) => {
                array(children.into_iter().map(|c| take(&mut built, c)).collect())
            }
            Some(Slot::Object(children)) => object(
                children
                    .into_iter()
                    .map(|(k, c)| (k, take(&mut built, c)))
                    .collect(),
            ),
            None => empty(),
        };
        built[idx] = Some(value);
    }
    take(&mut built, 0)
}

/// Copy a host value into something that may cross the boundary.
///
/// - primitives and handles pass through
/// - functions become callable function handles
/// - objects exposed as proxies become object handles
/// - iterables are drained into arrays
/// - event emitters become `{}`
/// - plain objects and arrays are copied member by member
pub fn make_transferable(value: HostValue) -> BoundaryValue {
    let mut slots: Vec<Option<Slot<BoundaryValue>>> = vec![None];
    let mut work: Vec<(usize, HostValue, Option<Rc<PathNode>>)> = vec![(0, value, None)];

    while let Some((idx, value, path)) = work.pop() {
        let slot = match value {
            HostValue::Undefined => Slot::Done(BoundaryValue::undefined()),
            HostValue::Null => Slot::Done(BoundaryValue::Primitive(Primitive::Null)),
            HostValue::Bool(b) => Slot::Done(BoundaryValue::Primitive(Primitive::Bool(b))),
            HostValue::Number(n) => Slot::Done(BoundaryValue::Primitive(Primitive::Number(n))),
            HostValue::String(s) => Slot::Done(BoundaryValue::Primitive(Primitive::String(s))),
            HostValue::Handle(handle) => Slot::Done(BoundaryValue::OpaqueHandle(handle)),
            HostValue::Function(function) => {
                Slot::Done(BoundaryValue::OpaqueHandle(Handle::function(function)))
            }
            HostValue::Emitter(_) => Slot::Done(BoundaryValue::empty_object()),
            HostValue::Array(items) => Slot::Array(push_items(&mut slots, &mut work, items, &path)),
            HostValue::Iterable(iterable) => {
                Slot::Array(push_items(&mut slots, &mut work, iterable.materialize(), &path))
            }
            HostValue::Object(object) => match object.exposure() {
                Exposure::Proxy { deny } => {
                    let handle = Handle::object(object.clone(), deny.clone());
                    Slot::Done(BoundaryValue::OpaqueHandle(handle))
                }
                Exposure::Copy if on_path(path.as_ref(), object.ptr()) => {
                    Slot::Done(BoundaryValue::string(CIRCULAR))
                }
                Exposure::Copy => Slot::Object(push_members(&mut slots, &mut work, &object, path)),
            },
        };
        slots[idx] = Some(slot);
    }

    assemble(
        slots,
        |items| BoundaryValue::Structured(Structured::Array(items)),
        |members| BoundaryValue::Structured(Structured::Object(members)),
        BoundaryValue::undefined,
    )
}

type Work = Vec<(usize, HostValue, Option<Rc<PathNode>>)>;

fn push_items<T>(
    slots: &mut Vec<Option<Slot<T>>>,
    work: &mut Work,
    items: Vec<HostValue>,
    path: &Option<Rc<PathNode>>,
) -> Vec<usize> {
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        let child = slots.len();
        slots.push(None);
        children.push(child);
        work.push((child, item, path.clone()));
    }
    children
}

fn push_members<T>(
    slots: &mut Vec<Option<Slot<T>>>,
    work: &mut Work,
    object: &HostObject,
    path: Option<Rc<PathNode>>,
) -> Vec<(String, usize)> {
    let path = Some(Rc::new(PathNode {
        ptr: object.ptr(),
        parent: path,
    }));
    let entries = object.entries();
    let mut children = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let child = slots.len();
        slots.push(None);
        children.push((key, child));
        work.push((child, value, path.clone()));
    }
    children
}

/// Convert a boundary value back into a host value.
///
/// Structured data becomes fresh host-owned data; handles stay handles.
pub fn into_host(value: BoundaryValue) -> HostValue {
    let mut slots: Vec<Option<Slot<HostValue>>> = vec![None];
    let mut work: Vec<(usize, BoundaryValue)> = vec![(0, value)];

    while let Some((idx, value)) = work.pop() {
        let slot = match value {
            BoundaryValue::Primitive(p) => Slot::Done(match p {
                Primitive::Undefined => HostValue::Undefined,
                Primitive::Null => HostValue::Null,
                Primitive::Bool(b) => HostValue::Bool(b),
                Primitive::Number(n) => HostValue::Number(n),
                Primitive::String(s) => HostValue::String(s),
            }),
            BoundaryValue::OpaqueHandle(handle) => Slot::Done(HostValue::Handle(handle)),
            BoundaryValue::Structured(Structured::Array(items)) => {
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    let child = slots.len();
                    slots.push(None);
                    children.push(child);
                    work.push((child, item));
                }
                Slot::Array(children)
            }
            BoundaryValue::Structured(Structured::Object(members)) => {
                let mut children = Vec::with_capacity(members.len());
                for (key, member) in members {
                    let child = slots.len();
                    slots.push(None);
                    children.push((key, child));
                    work.push((child, member));
                }
                Slot::Object(children)
            }
        };
        slots[idx] = Some(slot);
    }

    assemble(
        slots,
        HostValue::Array,
        |members| HostValue::Object(HostObject::from_entries(members)),
        || HostValue::Undefined,
    )
}

/// Render a boundary value as JSON for execution records and logs.
///
/// Follows `JSON.stringify` conventions: `undefined` members are dropped,
/// `undefined` array items and non-finite numbers become `null`. Function
/// handles render as `"[Function]"`; object handles render their visible
/// members, with a handle reached again through itself rendered as
/// [`CIRCULAR`].
pub fn render(value: &BoundaryValue) -> Value {
    let mut open = Vec::new();
    render_inner(value, &mut open)
}

fn render_inner(value: &BoundaryValue, open: &mut Vec<usize>) -> Value {
    match value {
        BoundaryValue::Primitive(p) => match p {
            Primitive::Undefined | Primitive::Null => Value::Null,
            Primitive::Bool(b) => Value::Bool(*b),
            Primitive::Number(n) => Number::from_f64(*n).map_or(Value::Null, |n| {
                // Integral values render without a trailing `.0`.
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                        Value::Number(Number::from(f as i64))
                    }
                    _ => Value::Number(n),
                }
            }),
            Primitive::String(s) => Value::String(s.clone()),
        },
        BoundaryValue::Structured(Structured::Array(items)) => {
            Value::Array(items.iter().map(|item| render_inner(item, open)).collect())
        }
        BoundaryValue::Structured(Structured::Object(members)) => {
            let mut map = Map::new();
            for (key, member) in members {
                if member.is_undefined() {
                    continue;
                }
                map.insert(key.clone(), render_inner(member, open));
            }
            Value::Object(map)
        }
        BoundaryValue::OpaqueHandle(handle) => match handle.kind() {
            HandleKind::Function => Value::String("[Function]".to_string()),
            HandleKind::Object if open.contains(&handle.ptr()) => {
                Value::String(CIRCULAR.to_string())
            }
            HandleKind::Object => {
                open.push(handle.ptr());
                let rendered = render_inner(&handle.snapshot(), open);
                open.pop();
                rendered
            }
        },
    }
}
