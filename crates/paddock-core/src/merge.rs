//! Deep merge of partial updates into the state document.
//!
//! Objects merge key by key and every other value type replaces whatever
//! was there before. One extension covers the incremental list updates the
//! native timing feed sends: an object whose keys are all decimal indices,
//! merged onto an array, patches the array element-wise and appends past
//! the end.

use serde_json::{Map, Value};

/// Deep-merge `patch` into `target`.
///
/// - object onto object: recurse per key, untouched keys survive
/// - index-keyed object onto array: patch elements by position
/// - anything else: `target` is replaced by `patch`
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => match target {
            Value::Object(target_map) => merge_map(target_map, patch_map),
            Value::Array(items) if is_index_map(patch_map) => merge_indexed(items, patch_map),
            _ => {
                let mut fresh = Map::new();
                merge_map(&mut fresh, patch_map);
                *target = Value::Object(fresh);
            }
        },
        other => other.clone_into(target),
    }
}

/// Deep-merge every key of `patch` into `target`.
pub fn merge_map(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if let Some(existing) = target.get_mut(key) {
            deep_merge(existing, value);
        } else {
            let mut slot = Value::Null;
            deep_merge(&mut slot, value);
            target.insert(key.clone(), slot);
        }
    }
}

/// `true` when every key of the map is a decimal array index.
///
/// Vacuously true for an empty map, which makes an empty patch onto an
/// array a no-op instead of a replacement.
fn is_index_map(map: &Map<String, Value>) -> bool {
    map.keys().all(|k| k.parse::<usize>().is_ok())
}

fn merge_indexed(items: &mut Vec<Value>, patch: &Map<String, Value>) {
    let mut entries: Vec<(usize, &Value)> = patch
        .iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v)))
        .collect();
    entries.sort_by_key(|(idx, _)| *idx);

    for (idx, value) in entries {
        if let Some(existing) = items.get_mut(idx) {
            deep_merge(existing, value);
        } else {
            let mut slot = Value::Null;
            deep_merge(&mut slot, value);
            items.push(slot);
        }
    }
}
