//! Structural JSON diff and patch
//!
//! Deltas use the jsondiffpatch layout so that peers written against that
//! library interoperate over the same relay:
//!
//! - added: `[new]`
//! - modified: `[old, new]`
//! - deleted: `[old, 0, 0]`
//! - object: `{ key: delta, ... }`
//! - array: `{ "_t": "a", "<new index>": delta, "_<old index>": [old, 0, 0] }`
//! - array move (patch only): `{ "_<old index>": ["", <new index>, 3] }`
//!
//! Arrays are diffed positionally after trimming the common head and tail,
//! which keeps deltas small for appends, prepends and in-place edits without
//! an LCS pass. Patching accepts every array operation listed above.

use serde_json::{Map, Value};

use crate::errors::PatchError;

const ARRAY_MARKER_KEY: &str = "_t";
const ARRAY_MARKER: &str = "a";
const OP_DELETED: i64 = 0;
const OP_TEXT_DIFF: i64 = 2;
const OP_MOVED: i64 = 3;

// ----------------------------------------------------------------------------
// Diff
// ----------------------------------------------------------------------------

/// Compute the delta that turns `left` into `right`
///
/// Returns `None` when the values are structurally equal.
pub fn diff(left: &Value, right: &Value) -> Option<Value> {
    if left == right {
        return None;
    }

    match (left, right) {
        (Value::Object(l), Value::Object(r)) => diff_objects(l, r),
        (Value::Array(l), Value::Array(r)) => diff_arrays(l, r),
        _ => Some(modified(left, right)),
    }
}

fn diff_objects(left: &Map<String, Value>, right: &Map<String, Value>) -> Option<Value> {
    let mut delta = Map::new();

    for (key, old) in left {
        match right.get(key) {
            Some(new) => {
                if let Some(child) = diff(old, new) {
                    delta.insert(key.clone(), child);
                }
            }
            None => {
                delta.insert(key.clone(), deleted(old));
            }
        }
    }

    for (key, new) in right {
        if !left.contains_key(key) {
            delta.insert(key.clone(), added(new));
        }
    }

    if delta.is_empty() {
        None
    } else {
        Some(Value::Object(delta))
    }
}

fn diff_arrays(left: &[Value], right: &[Value]) -> Option<Value> {
    let head = left
        .iter()
        .zip(right.iter())
        .take_while(|(l, r)| l == r)
        .count();

    let max_tail = left.len().min(right.len()) - head;
    let tail = left
        .iter()
        .rev()
        .zip(right.iter().rev())
        .take(max_tail)
        .take_while(|(l, r)| l == r)
        .count();

    let old_middle = &left[head..left.len() - tail];
    let new_middle = &right[head..right.len() - tail];
    let shared = old_middle.len().min(new_middle.len());

    let mut delta = Map::new();
    delta.insert(
        ARRAY_MARKER_KEY.to_string(),
        Value::String(ARRAY_MARKER.to_string()),
    );

    for offset in 0..shared {
        if let Some(child) = diff(&old_middle[offset], &new_middle[offset]) {
            delta.insert((head + offset).to_string(), child);
        }
    }
    for (offset, new) in new_middle.iter().enumerate().skip(shared) {
        delta.insert((head + offset).to_string(), added(new));
    }
    for (offset, old) in old_middle.iter().enumerate().skip(shared) {
        delta.insert(format!("_{}", head + offset), deleted(old));
    }

    if delta.len() == 1 {
        None
    } else {
        Some(Value::Object(delta))
    }
}

fn added(new: &Value) -> Value {
    Value::Array(vec![new.clone()])
}

fn modified(old: &Value, new: &Value) -> Value {
    Value::Array(vec![old.clone(), new.clone()])
}

fn deleted(old: &Value) -> Value {
    Value::Array(vec![old.clone(), Value::from(0), Value::from(OP_DELETED)])
}

// ----------------------------------------------------------------------------
// Patch
// ----------------------------------------------------------------------------

/// Apply `delta` to `base`, producing the patched value
///
/// Nested deltas that target a missing or differently-typed node are applied
/// against an empty container of the expected kind. A root-level deletion
/// yields `Value::Null`.
pub fn patch(base: Value, delta: &Value) -> Result<Value, PatchError> {
    Ok(patch_node(Some(base), delta)?.unwrap_or(Value::Null))
}

/// Patch one node; `None` in or out means the node is absent
fn patch_node(base: Option<Value>, delta: &Value) -> Result<Option<Value>, PatchError> {
    match delta {
        Value::Array(ops) => patch_leaf(ops),
        Value::Object(children) if is_array_delta(children) => {
            let items = match base {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            patch_array(items, children).map(|items| Some(Value::Array(items)))
        }
        Value::Object(children) => {
            let mut fields = match base {
                Some(Value::Object(fields)) => fields,
                _ => Map::new(),
            };
            for (key, child) in children {
                let current = fields.remove(key);
                if let Some(value) = patch_node(current, child)? {
                    fields.insert(key.clone(), value);
                }
            }
            Ok(Some(Value::Object(fields)))
        }
        other => Err(PatchError::InvalidDelta {
            found: other.to_string(),
        }),
    }
}

fn patch_leaf(ops: &[Value]) -> Result<Option<Value>, PatchError> {
    match ops {
        [new] => Ok(Some(new.clone())),
        [_, new] => Ok(Some(new.clone())),
        [_, _, code] => match code.as_i64() {
            Some(OP_DELETED) => Ok(None),
            Some(code) => Err(PatchError::UnsupportedOperation { code }),
            None => Err(PatchError::InvalidDelta {
                found: code.to_string(),
            }),
        },
        _ => Err(PatchError::InvalidDelta {
            found: Value::Array(ops.to_vec()).to_string(),
        }),
    }
}

fn is_array_delta(children: &Map<String, Value>) -> bool {
    children.get(ARRAY_MARKER_KEY).and_then(Value::as_str) == Some(ARRAY_MARKER)
}

fn patch_array(
    mut items: Vec<Value>,
    children: &Map<String, Value>,
) -> Result<Vec<Value>, PatchError> {
    let mut removals: Vec<(usize, Option<usize>)> = Vec::new();
    let mut insertions: Vec<(usize, Value)> = Vec::new();
    let mut modifications: Vec<(usize, &Value)> = Vec::new();

    for (key, child) in children {
        if key == ARRAY_MARKER_KEY {
            continue;
        }

        if let Some(old_index) = key.strip_prefix('_') {
            let index = parse_index(key, old_index)?;
            match child.as_array().map(Vec::as_slice) {
                Some([_, _, code]) if code.as_i64() == Some(OP_DELETED) => {
                    removals.push((index, None));
                }
                Some([_, to, code]) if code.as_i64() == Some(OP_MOVED) => {
                    let to = to.as_u64().ok_or_else(|| PatchError::InvalidArrayKey {
                        key: key.clone(),
                    })?;
                    removals.push((index, Some(to as usize)));
                }
                Some([_, _, code]) if code.as_i64() == Some(OP_TEXT_DIFF) => {
                    return Err(PatchError::UnsupportedOperation { code: OP_TEXT_DIFF });
                }
                _ => {
                    return Err(PatchError::InvalidDelta {
                        found: child.to_string(),
                    })
                }
            }
            continue;
        }

        let index = parse_index(key, key)?;
        match child.as_array().map(Vec::as_slice) {
            Some([new]) => insertions.push((index, new.clone())),
            _ => modifications.push((index, child)),
        }
    }

    // Removals run highest index first so earlier indices stay valid.
    removals.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, move_to) in removals {
        if index >= items.len() {
            return Err(PatchError::IndexOutOfBounds {
                index,
                len: items.len(),
            });
        }
        let item = items.remove(index);
        if let Some(to) = move_to {
            insertions.push((to, item));
        }
    }

    insertions.sort_by(|a, b| a.0.cmp(&b.0));
    for (index, value) in insertions {
        if index >= items.len() {
            items.push(value);
        } else {
            items.insert(index, value);
        }
    }

    for (index, child) in modifications {
        let len = items.len();
        let slot = items
            .get_mut(index)
            .ok_or(PatchError::IndexOutOfBounds { index, len })?;
        let current = std::mem::take(slot);
        match patch_node(Some(current), child)? {
            Some(value) => *slot = value,
            None => {
                return Err(PatchError::InvalidDelta {
                    found: child.to_string(),
                })
            }
        }
    }

    Ok(items)
}

fn parse_index(key: &str, digits: &str) -> Result<usize, PatchError> {
    digits.parse().map_err(|_| PatchError::InvalidArrayKey {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(left: Value, right: Value) {
        let delta = diff(&left, &right);
        let patched = match delta {
            Some(delta) => patch(left, &delta).unwrap(),
            None => left,
        };
        assert_eq!(patched, right);
    }

    #[test]
    fn test_equal_values_have_no_delta() {
        assert_eq!(diff(&json!({"x": [1, 2]}), &json!({"x": [1, 2]})), None);
        assert_eq!(diff(&json!(3), &json!(3)), None);
    }

    #[test]
    fn test_object_delta_layout() {
        let delta = diff(&json!({"x": 1, "gone": true}), &json!({"x": 2, "new": "a"})).unwrap();
        assert_eq!(
            delta,
            json!({"x": [1, 2], "gone": [true, 0, 0], "new": ["a"]})
        );
    }

    #[test]
    fn test_primitive_root_is_replaced() {
        assert_eq!(diff(&json!(0), &json!(5)), Some(json!([0, 5])));
        roundtrip(json!("a"), json!({"b": 1}));
    }

    #[test]
    fn test_array_append_and_prepend() {
        assert_eq!(
            diff(&json!([1, 2]), &json!([1, 2, 3])),
            Some(json!({"_t": "a", "2": [3]}))
        );
        assert_eq!(
            diff(&json!([1, 2]), &json!([0, 1, 2])),
            Some(json!({"_t": "a", "0": [0]}))
        );
        roundtrip(json!([1, 2, 3]), json!([1, 3]));
        roundtrip(json!([{"a": 1}, 2]), json!([{"a": 2}, 2, 9]));
    }

    #[test]
    fn test_nested_roundtrip() {
        roundtrip(
            json!({"pos": {"x": 0, "y": [1, 2, {"z": null}]}, "name": "tank"}),
            json!({"pos": {"x": 4, "y": [2, {"z": false}]}, "hp": 100}),
        );
    }

    #[test]
    fn test_patch_against_empty_object_when_baseline_missing() {
        let delta = json!({"x": [1, 2]});
        assert_eq!(patch(json!({}), &delta).unwrap(), json!({"x": 2}));
    }

    #[test]
    fn test_patch_applies_array_moves() {
        let delta = json!({"_t": "a", "_0": ["", 2, 3]});
        assert_eq!(patch(json!(["a", "b", "c"]), &delta).unwrap(), json!(["b", "c", "a"]));
    }

    #[test]
    fn test_patch_rejects_text_diffs_and_garbage() {
        assert_eq!(
            patch(json!({"t": "abc"}), &json!({"t": ["@@ -1 +1 @@", 0, 2]})),
            Err(PatchError::UnsupportedOperation { code: 2 })
        );
        assert!(patch(json!({}), &json!(42)).is_err());
        assert!(matches!(
            patch(json!([1]), &json!({"_t": "a", "_5": [1, 0, 0]})),
            Err(PatchError::IndexOutOfBounds { index: 5, len: 1 })
        ));
    }
}
