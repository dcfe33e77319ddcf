//! Replication records and their deterministic application.
//!
//! Paths are JSON pointers (`""` is the root, `/a/0` the first element of
//! `a`). Records are applied in order against a working copy so a batch is
//! all-or-nothing.

use crate::error::ProtocolViolation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Most nulls a single array write may pad before its index.
pub const MAX_SPARSE_GAP: usize = 1024;

/// Container-mutating operations replayed by name on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMethod {
    Push,
    Pop,
    Shift,
    Unshift,
    Splice,
    Reverse,
}

impl fmt::Display for ArrayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Pop => "pop",
            Self::Shift => "shift",
            Self::Unshift => "unshift",
            Self::Splice => "splice",
            Self::Reverse => "reverse",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    Set {
        path: String,
        value: Value,
    },
    Delete {
        path: String,
    },
    Call {
        path: String,
        method: ArrayMethod,
        #[serde(default)]
        arguments: Vec<Value>,
    },
}

impl MutationOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Delete { path } | Self::Call { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    #[serde(flatten)]
    pub op: MutationOp,
    /// Stream-completion marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl MutationRecord {
    pub fn new(op: MutationOp) -> Self {
        Self { op, done: false }
    }
}

/// Parse a batch payload. Empty batches are valid and carry nothing.
pub fn decode_batch(payload: &Value) -> Result<Vec<MutationRecord>, ProtocolViolation> {
    serde_json::from_value(payload.clone())
        .map_err(|error| ProtocolViolation::MalformedBatch(error.to_string()))
}

/// Apply one record in place.
pub fn apply_record(root: &mut Value, record: &MutationRecord) -> Result<(), ProtocolViolation> {
    match &record.op {
        MutationOp::Set { path, value } => set_at_pointer(root, path, value.clone()),
        MutationOp::Delete { path } => delete_at_pointer(root, path),
        MutationOp::Call {
            path,
            method,
            arguments,
        } => call_at_pointer(root, path, *method, arguments),
    }
}

/// Apply a batch to a copy of `root` and return it; `root` is untouched on error.
pub fn apply_batch(root: &Value, batch: &[MutationRecord]) -> Result<Value, ProtocolViolation> {
    let mut working = root.clone();
    for record in batch {
        apply_record(&mut working, record)?;
    }
    Ok(working)
}

/// Escape one key for use as a pointer segment.
pub fn pointer_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn split_parent(path: &str) -> Result<(&str, String), ProtocolViolation> {
    if !path.starts_with('/') {
        return Err(ProtocolViolation::InvalidPath(path.to_owned()));
    }
    path.rsplit_once('/')
        .map(|(parent, leaf)| (parent, unescape(leaf)))
        .ok_or_else(|| ProtocolViolation::InvalidPath(path.to_owned()))
}

fn container_at<'a>(root: &'a mut Value, pointer: &str) -> Result<&'a mut Value, ProtocolViolation> {
    root.pointer_mut(pointer)
        .ok_or_else(|| ProtocolViolation::InvalidPath(pointer.to_owned()))
}

fn array_index(key: &str, path: &str) -> Result<usize, ProtocolViolation> {
    key.parse::<usize>()
        .map_err(|_| ProtocolViolation::InvalidPath(path.to_owned()))
}

fn set_at_pointer(root: &mut Value, path: &str, value: Value) -> Result<(), ProtocolViolation> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let (parent, key) = split_parent(path)?;
    match container_at(root, parent)? {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(&key, path)?;
            if index < items.len() {
                items[index] = value;
            } else if index - items.len() <= MAX_SPARSE_GAP {
                items.resize(index, Value::Null);
                items.push(value);
            } else {
                return Err(ProtocolViolation::InvalidPath(path.to_owned()));
            }
            Ok(())
        }
        _ => Err(ProtocolViolation::TypeConflict {
            path: parent.to_owned(),
            expected: "object or array",
        }),
    }
}

fn delete_at_pointer(root: &mut Value, path: &str) -> Result<(), ProtocolViolation> {
    let (parent, key) = split_parent(path)?;
    match container_at(root, parent)? {
        Value::Object(map) => {
            map.remove(&key);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(&key, path)?;
            if index < items.len() {
                items.remove(index);
            }
            Ok(())
        }
        _ => Err(ProtocolViolation::TypeConflict {
            path: parent.to_owned(),
            expected: "object or array",
        }),
    }
}

fn call_at_pointer(
    root: &mut Value,
    path: &str,
    method: ArrayMethod,
    arguments: &[Value],
) -> Result<(), ProtocolViolation> {
    let items = container_at(root, path)?
        .as_array_mut()
        .ok_or_else(|| ProtocolViolation::TypeConflict {
            path: path.to_owned(),
            expected: "array",
        })?;
    let invalid = || ProtocolViolation::InvalidArguments {
        method: method.to_string(),
        path: path.to_owned(),
    };

    match method {
        ArrayMethod::Push => items.extend(arguments.iter().cloned()),
        ArrayMethod::Pop => {
            items.pop();
        }
        ArrayMethod::Shift => {
            if !items.is_empty() {
                items.remove(0);
            }
        }
        ArrayMethod::Unshift => {
            items.splice(0..0, arguments.iter().cloned());
        }
        ArrayMethod::Reverse => items.reverse(),
        ArrayMethod::Splice => {
            let len = items.len() as i64;
            let start = arguments.first().and_then(Value::as_i64).ok_or_else(invalid)?;
            let start = if start < 0 {
                (len + start).max(0)
            } else {
                start.min(len)
            } as usize;
            let delete_count = match arguments.get(1) {
                Some(count) => count.as_i64().ok_or_else(invalid)?.max(0) as usize,
                None => items.len() - start,
            };
            let end = start.saturating_add(delete_count).min(items.len());
            let inserted = arguments.iter().skip(2).cloned();
            items.splice(start..end, inserted);
        }
    }
    Ok(())
}
