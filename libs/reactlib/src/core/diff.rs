// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Structural deltas between successive generator chunks.
//!
//! Diff-mode streaming sends only what changed since the previous chunk.
//! Paths address into objects by key and arrays by index; string and array
//! growth is expressed as an append so progressive text streams stay small.

use crate::core::value::Value;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    Replace { path: Vec<Value>, value: Value },
    Add { path: Vec<Value>, value: Value },
    Delete { path: Vec<Value> },
    Append { path: Vec<Value>, value: Value },
}

/// Compute the structural delta turning `old` into `new`.
pub fn compute_diff(old: &Value, new: &Value) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    diff_at(&mut Vec::new(), old, new, &mut ops);
    ops
}

fn diff_at(path: &mut Vec<Value>, old: &Value, new: &Value, ops: &mut Vec<DiffOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    let mut p = path.clone();
                    p.push(key.as_str().into());
                    ops.push(DiffOp::Delete { path: p });
                }
            }
            for (key, new_value) in new_map {
                path.push(key.as_str().into());
                match old_map.get(key) {
                    Some(old_value) => diff_at(path, old_value, new_value, ops),
                    None => ops.push(DiffOp::Add {
                        path: path.clone(),
                        value: new_value.clone(),
                    }),
                }
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let common = old_items.len().min(new_items.len());
            for i in 0..common {
                path.push(i.into());
                diff_at(path, &old_items[i], &new_items[i], ops);
                path.pop();
            }
            for item in &new_items[common..] {
                ops.push(DiffOp::Append {
                    path: path.clone(),
                    value: item.clone(),
                });
            }
            // Deletions from the end keep earlier indices stable.
            for i in (common..old_items.len()).rev() {
                let mut p = path.clone();
                p.push(i.into());
                ops.push(DiffOp::Delete { path: p });
            }
        }
        (Value::String(old_str), Value::String(new_str)) => {
            if !old_str.is_empty() && new_str.starts_with(old_str.as_str()) {
                ops.push(DiffOp::Append {
                    path: path.clone(),
                    value: new_str[old_str.len()..].into(),
                });
            } else {
                ops.push(DiffOp::Replace {
                    path: path.clone(),
                    value: new.clone(),
                });
            }
        }
        _ => ops.push(DiffOp::Replace {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

/// Apply a delta produced by [`compute_diff`]. The relay layer's client does
/// the equivalent; the engine uses this in tests and for shadow validation.
pub fn apply_diff(value: &mut Value, ops: &[DiffOp]) {
    for op in ops {
        match op {
            DiffOp::Replace { path, value: v } | DiffOp::Add { path, value: v } => {
                if path.is_empty() {
                    *value = v.clone();
                } else if let Some(target) = resolve_parent(value, path) {
                    set_at(target, path.last(), v.clone());
                }
            }
            DiffOp::Delete { path } => {
                if let Some(target) = resolve_parent(value, path) {
                    match (target, path.last()) {
                        (Value::Object(map), Some(Value::String(key))) => {
                            map.remove(key);
                        }
                        (Value::Array(items), Some(seg)) => {
                            if let Some(i) = seg.as_u64() {
                                let i = i as usize;
                                if i < items.len() {
                                    items.remove(i);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            DiffOp::Append { path, value: v } => {
                let target = resolve_path(value, path);
                match (target, v) {
                    (Some(Value::String(s)), Value::String(suffix)) => s.push_str(suffix),
                    (Some(Value::Array(items)), item) => items.push(item.clone()),
                    _ => {}
                }
            }
        }
    }
}

fn resolve_path<'a>(value: &'a mut Value, path: &[Value]) -> Option<&'a mut Value> {
    let mut current = value;
    for seg in path {
        current = match (current, seg) {
            (Value::Object(map), Value::String(key)) => map.get_mut(key)?,
            (Value::Array(items), seg) => items.get_mut(seg.as_u64()? as usize)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve_parent<'a>(value: &'a mut Value, path: &[Value]) -> Option<&'a mut Value> {
    if path.is_empty() {
        return None;
    }
    resolve_path(value, &path[..path.len() - 1])
}

fn set_at(parent: &mut Value, seg: Option<&Value>, new_value: Value) {
    match (parent, seg) {
        (Value::Object(map), Some(Value::String(key))) => {
            map.insert(key.clone(), new_value);
        }
        (Value::Array(items), Some(seg)) => {
            if let Some(i) = seg.as_u64() {
                let i = i as usize;
                if i < items.len() {
                    items[i] = new_value;
                } else {
                    items.push(new_value);
                }
            }
        }
        _ => {}
    }
}
