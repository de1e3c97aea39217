//! Hand-written RFC 7386 JSON merge-patch diff (spec.md §9).
//!
//! No crate in reach implements `k8s.io/apimachinery/pkg/util/jsonmergepatch`'s
//! three-way merge patch. The dedup path only ever calls it with
//! `original == current` (the cached previous request body), which collapses
//! the three-way case to a plain two-way diff from `original` to `modified`,
//! so that's the only case implemented here.

use serde_json::{Map, Value};

/// Computes the RFC 7386 merge patch that transforms `original` into
/// `modified`. Keys present in both with equal values are omitted; keys
/// removed in `modified` become explicit `null`s; everything else is taken
/// from `modified` (recursing into nested objects).
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig_map), Value::Object(mod_map)) => {
            let mut patch = Map::new();
            for (key, mod_val) in mod_map {
                match orig_map.get(key) {
                    Some(orig_val) if orig_val == mod_val => {}
                    Some(orig_val) => {
                        patch.insert(key.clone(), create_merge_patch(orig_val, mod_val));
                    }
                    None => {
                        patch.insert(key.clone(), mod_val.clone());
                    }
                }
            }
            for key in orig_map.keys() {
                if !mod_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ if original == modified => Value::Null,
        _ => modified.clone(),
    }
}

/// Three-way merge patch reduced to the two-way case used by dedup
/// (`current == original`, i.e. nothing else has touched the object between
/// the two observed requests).
pub fn create_three_way_merge_patch(original: &Value, modified: &Value, current: &Value) -> Value {
    if current == original {
        create_merge_patch(original, modified)
    } else {
        // No intervening-edit reconciliation without the full three-way
        // algorithm; fall back to the direct diff against the observed
        // current state, which is the conservative (non-empty) answer.
        create_merge_patch(current, modified)
    }
}

/// A patch is empty when it carries no changes: `null`, `{}`, or the literal
/// empty object serialized as a string.
pub fn is_empty_patch_value(patch: &Value) -> bool {
    match patch {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_change_yields_empty_object() {
        let orig = json!({"a": 1, "b": {"c": 2}});
        let patch = create_merge_patch(&orig, &orig);
        assert!(is_empty_patch_value(&patch));
    }

    #[test]
    fn changed_field_is_included() {
        let orig = json!({"a": 1, "b": 2});
        let modified = json!({"a": 1, "b": 3});
        let patch = create_merge_patch(&orig, &modified);
        assert_eq!(patch, json!({"b": 3}));
    }

    #[test]
    fn removed_field_becomes_null() {
        let orig = json!({"a": 1, "b": 2});
        let modified = json!({"a": 1});
        let patch = create_merge_patch(&orig, &modified);
        assert_eq!(patch, json!({"b": Value::Null}));
    }

    #[test]
    fn nested_object_diffs_recursively() {
        let orig = json!({"spec": {"replicas": 1, "image": "x"}});
        let modified = json!({"spec": {"replicas": 2, "image": "x"}});
        let patch = create_merge_patch(&orig, &modified);
        assert_eq!(patch, json!({"spec": {"replicas": 2}}));
    }

    #[test]
    fn three_way_collapses_when_current_equals_original() {
        let orig = json!({"a": 1});
        let modified = json!({"a": 2});
        let patch = create_three_way_merge_patch(&orig, &modified, &orig);
        assert_eq!(patch, json!({"a": 2}));
    }
}
