//! JSON wire encoding for boundary values.
//!
//! Values cross the V8 boundary as JSON text. Everything JSON cannot say
//! natively is tagged with the reserved `$fw` key:
//!
//! | tag | meaning |
//! |-----|---------|
//! | `{"$fw":"u"}` | `undefined` |
//! | `{"$fw":"n","v":"NaN"}` | non-finite number |
//! | `{"$fw":"o","v":{..}}` | object that itself has a `$fw` member |
//! | `{"$fw":"h","id":N,"kind":..,"mode":..}` | host handle |
//! | `{"$fw":"g"}` | the sandbox's own global object |
//! | `{"$fw":"f","name":..}` | sandbox function (outbound only) |
//!
//! Parsing goes through `serde_json`, whose nesting limit keeps hostile
//! input from exhausting the host stack.

use serde_json::{json, Map, Number, Value};
use thiserror::Error;

use super::proxy::HandleTable;
use super::{BoundaryValue, HandleKind, Primitive, Structured, CIRCULAR};

const TAG: &str = "$fw";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed boundary payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown handle id {0}")]
    UnknownHandle(u64),
}

/// The marker a sandbox revives as its own `globalThis`.
pub fn global_marker() -> Value {
    json!({ TAG: "g" })
}

/// Encode for a sandbox that can hold live handles.
pub fn encode(value: &BoundaryValue, table: &mut HandleTable) -> Value {
    encode_inner(value, &mut Some(table), &mut Vec::new())
}

/// Encode for a sandbox that cannot hold handles (worker threads).
///
/// Function handles are dropped to `undefined`; object handles are copied
/// as their visible members.
pub fn encode_detached(value: &BoundaryValue) -> Value {
    encode_inner(value, &mut None, &mut Vec::new())
}

fn encode_inner(
    value: &BoundaryValue,
    table: &mut Option<&mut HandleTable>,
    open: &mut Vec<usize>,
) -> Value {
    match value {
        BoundaryValue::Primitive(p) => encode_primitive(p),
        BoundaryValue::Structured(Structured::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| encode_inner(item, table, open))
                .collect(),
        ),
        BoundaryValue::Structured(Structured::Object(members)) => {
            let mut map = Map::new();
            let mut tagged = false;
            for (key, member) in members {
                tagged |= key == TAG;
                map.insert(key.clone(), encode_inner(member, table, open));
            }
            if tagged {
                json!({ TAG: "o", "v": Value::Object(map) })
            } else {
                Value::Object(map)
            }
        }
        BoundaryValue::OpaqueHandle(handle) => match table {
            Some(table) => {
                let kind = match handle.kind() {
                    HandleKind::Function => "function",
                    HandleKind::Object => "object",
                };
                let mode = if handle.is_async() { "async" } else { "sync" };
                let id = table.register(handle.clone());
                json!({ TAG: "h", "id": id, "kind": kind, "mode": mode })
            }
            None => match handle.kind() {
                HandleKind::Function => json!({ TAG: "u" }),
                HandleKind::Object if open.contains(&handle.ptr()) => {
                    Value::String(CIRCULAR.to_string())
                }
                HandleKind::Object => {
                    open.push(handle.ptr());
                    let encoded = encode_inner(&handle.snapshot(), table, open);
                    open.pop();
                    encoded
                }
            },
        },
    }
}

fn encode_primitive(p: &Primitive) -> Value {
    match p {
        Primitive::Undefined => json!({ TAG: "u" }),
        Primitive::Null => Value::Null,
        Primitive::Bool(b) => Value::Bool(*b),
        Primitive::String(s) => Value::String(s.clone()),
        Primitive::Number(n) => encode_number(*n),
    }
}

fn encode_number(n: f64) -> Value {
    if n.is_nan() {
        json!({ TAG: "n", "v": "NaN" })
    } else if n.is_infinite() {
        let v = if n > 0.0 { "Infinity" } else { "-Infinity" };
        json!({ TAG: "n", "v": v })
    } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 && !(n == 0.0 && n.is_sign_negative()) {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Parse JSON text produced by a sandbox.
pub fn parse(text: &str) -> Result<Value, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a sandbox-produced value. Handle ids are resolved against
/// `table`; with no table, any handle reference is an error.
pub fn decode(value: Value, table: Option<&HandleTable>) -> Result<BoundaryValue, WireError> {
    Ok(match value {
        Value::Null => BoundaryValue::Primitive(Primitive::Null),
        Value::Bool(b) => BoundaryValue::Primitive(Primitive::Bool(b)),
        Value::Number(n) => BoundaryValue::Primitive(Primitive::Number(n.as_f64().unwrap_or(f64::NAN))),
        Value::String(s) => BoundaryValue::Primitive(Primitive::String(s)),
        Value::Array(items) => BoundaryValue::Structured(Structured::Array(
            items
                .into_iter()
                .map(|item| decode(item, table))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(mut map) => match map.get(TAG).and_then(Value::as_str) {
            Some("u") => BoundaryValue::undefined(),
            Some("n") => {
                let n = match map.get("v").and_then(Value::as_str) {
                    Some("Infinity") => f64::INFINITY,
                    Some("-Infinity") => f64::NEG_INFINITY,
                    _ => f64::NAN,
                };
                BoundaryValue::Primitive(Primitive::Number(n))
            }
            Some("o") => match map.remove("v") {
                Some(Value::Object(inner)) => decode_members(inner, table)?,
                _ => BoundaryValue::empty_object(),
            },
            Some("h") => {
                let id = map.get("id").and_then(Value::as_u64).unwrap_or(u64::MAX);
                let handle = table
                    .and_then(|table| u32::try_from(id).ok().and_then(|id| table.get(id)))
                    .ok_or(WireError::UnknownHandle(id))?;
                BoundaryValue::OpaqueHandle(handle.clone())
            }
            Some("g") => BoundaryValue::string("[object global]"),
            Some("f") => {
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty())
                    .unwrap_or("anonymous");
                BoundaryValue::string(format!("[Function: {name}]"))
            }
            _ => decode_members(map, table)?,
        },
    })
}

fn decode_members(
    map: Map<String, Value>,
    table: Option<&HandleTable>,
) -> Result<BoundaryValue, WireError> {
    let members = map
        .into_iter()
        .map(|(key, value)| Ok((key, decode(value, table)?)))
        .collect::<Result<Vec<_>, WireError>>()?;
    Ok(BoundaryValue::Structured(Structured::Object(members)))
}

/// Decode a JSON array of call arguments.
pub fn decode_args(text: &str, table: Option<&HandleTable>) -> Result<Vec<BoundaryValue>, WireError> {
    match parse(text)? {
        Value::Array(items) => items.into_iter().map(|item| decode(item, table)).collect(),
        other => Ok(vec![decode(other, table)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{make_transferable, render, Handle, HostFunction, HostObject, HostValue};

    #[test]
    fn test_undefined_and_non_finite_are_tagged() {
        let value = BoundaryValue::Structured(Structured::Array(vec![
            BoundaryValue::undefined(),
            BoundaryValue::Primitive(Primitive::Number(f64::NEG_INFINITY)),
            BoundaryValue::Primitive(Primitive::Number(3.0)),
        ]));
        assert_eq!(
            encode_detached(&value),
            json!([{"$fw": "u"}, {"$fw": "n", "v": "-Infinity"}, 3])
        );
    }

    #[test]
    fn test_reserved_key_is_escaped() {
        let value = make_transferable(HostValue::from(json!({"$fw": "h", "id": 0})));
        let encoded = encode_detached(&value);
        assert_eq!(encoded["$fw"], "o");
        let decoded = decode(encoded, None).unwrap();
        assert_eq!(render(&decoded), json!({"$fw": "h", "id": 0}));
    }

    #[test]
    fn test_handles_register_and_resolve() {
        let mut table = HandleTable::new();
        let f = HostFunction::asynchronous(|_| async { Ok(HostValue::Null) });
        let encoded = encode(&make_transferable(HostValue::Function(f)), &mut table);
        assert_eq!(encoded["kind"], "function");
        assert_eq!(encoded["mode"], "async");
        match decode(encoded, Some(&table)).unwrap() {
            BoundaryValue::OpaqueHandle(handle) => assert!(handle.is_async()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_handle_is_rejected() {
        let table = HandleTable::new();
        let err = decode(json!({"$fw": "h", "id": 7}), Some(&table)).unwrap_err();
        assert!(matches!(err, WireError::UnknownHandle(7)));
    }

    #[test]
    fn test_detached_encoding_materializes_objects() {
        let obj = HostObject::proxied(&["clone"])
            .with("status", 201.0)
            .with("clone", HostFunction::sync(|_| Ok(HostValue::Null)))
            .with("cb", HostFunction::sync(|_| Ok(HostValue::Null)));
        let value = BoundaryValue::OpaqueHandle(Handle::object(
            obj,
            std::sync::Arc::from(vec!["clone".to_string()]),
        ));
        assert_eq!(encode_detached(&value), json!({"status": 201, "cb": {"$fw": "u"}}));
    }

    #[test]
    fn test_sandbox_function_marker_renders_name() {
        let decoded = decode(json!({"$fw": "f", "name": "handler"}), None).unwrap();
        assert_eq!(decoded.as_str(), Some("[Function: handler]"));
    }

    #[test]
    fn test_parse_rejects_hostile_nesting() {
        let text = "[".repeat(10_000) + &"]".repeat(10_000);
        assert!(parse(&text).is_err());
    }
}
