//! Minimal JSON merge patches.
//!
//! [`create_merge_patch`] diffs two serialized objects section by section
//! (`metadata`, `spec`, `status`, ...).  Inside a section each field is
//! compared as a unit: a field that differs anywhere is re-emitted whole, a
//! field that disappeared is emitted as an explicit `null`, and unchanged
//! fields are omitted.  [`apply_merge_patch`] implements RFC 7386 and is used
//! by the in-memory store.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Compute the minimal patch turning `original` into `desired`.
///
/// Returns `None` when the two values are identical.
pub fn create_merge_patch(original: &Value, desired: &Value) -> Option<Value> {
    diff_level(original, desired, 2)
}

/// Serialize both objects and compute the patch between them.
pub fn object_merge_patch<T: Serialize>(original: &T, desired: &T) -> Result<Option<Value>> {
    let original = serde_json::to_value(original)?;
    let desired = serde_json::to_value(desired)?;
    Ok(create_merge_patch(&original, &desired))
}

fn diff_level(original: &Value, desired: &Value, depth: usize) -> Option<Value> {
    if original == desired {
        return None;
    }
    let (Value::Object(orig), Value::Object(want)) = (original, desired) else {
        return Some(desired.clone());
    };
    if depth == 0 {
        return Some(desired.clone());
    }

    let mut patch = Map::new();
    for (field, value) in want {
        match orig.get(field) {
            Some(old) if old == value => {}
            Some(old) if depth > 1 => {
                if let Some(sub) = diff_level(old, value, depth - 1) {
                    patch.insert(field.clone(), sub);
                }
            }
            _ => {
                patch.insert(field.clone(), value.clone());
            }
        }
    }
    for (field, old) in orig {
        if !old.is_null() && !want.contains_key(field) {
            patch.insert(field.clone(), Value::Null);
        }
    }

    if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    }
}

/// Apply an RFC 7386 merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                fields.remove(key);
            } else {
                apply_merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
