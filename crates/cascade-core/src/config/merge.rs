//! Deep merge and dotted-key helpers
//!
//! Merge semantics, later input wins:
//! - Mapping over mapping: merged key by key, recursively
//! - Anything else: the later value replaces the earlier one entirely
//!   (sequences are not concatenated, mappings and scalars replace each other)

use super::fragment::Mapping;
use serde_json::Value;

/// Deep merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            Value::Object(deep_merge_maps(base_map, overlay_map))
        }
        (_, overlay) => overlay,
    }
}

/// Deep merge two mappings, `overlay` taking priority
pub fn deep_merge_maps(mut base: Mapping, overlay: Mapping) -> Mapping {
    for (key, overlay_value) in overlay {
        match base.get_mut(&key) {
            // Merge in place so the base keeps its key order
            Some(slot) => {
                let base_value = std::mem::take(slot);
                *slot = deep_merge(base_value, overlay_value);
            }
            None => {
                base.insert(key, overlay_value);
            }
        }
    }
    base
}

/// Fold mappings from lowest to highest priority.
///
/// Inputs are borrowed and cloned, never modified.
pub fn merge_all<'a, I>(fragments: I) -> Mapping
where
    I: IntoIterator<Item = &'a Mapping>,
{
    fragments
        .into_iter()
        .fold(Mapping::new(), |acc, next| deep_merge_maps(acc, next.clone()))
}

/// Flatten nested mappings into `(dotted.key, leaf)` pairs, in document order.
///
/// Sequences are leaves. Empty nested mappings produce no entries.
pub fn flatten(map: &Mapping) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    flatten_into(map, "", &mut out);
    out
}

fn flatten_into<'a>(map: &'a Mapping, prefix: &str, out: &mut Vec<(String, &'a Value)>) {
    for (key, value) in map {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(child) => flatten_into(child, &dotted, out),
            leaf => out.push((dotted, leaf)),
        }
    }
}

/// Look up a dotted key
pub fn get_dotted<'a>(map: &'a Mapping, dotted: &str) -> Option<&'a Value> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Assign a value at a dotted key, creating intermediate mappings.
///
/// A non-mapping value sitting on the way is replaced by a mapping.
pub fn set_dotted(map: &mut Mapping, dotted: &str, value: Value) {
    let mut parts: Vec<&str> = dotted.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = map;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Mapping::new()));
        if !slot.is_object() {
            *slot = Value::Object(Mapping::new());
        }
        let Some(child) = slot.as_object_mut() else {
            return;
        };
        current = child;
    }
    current.insert(last.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(v: Value) -> Mapping {
        match v {
            Value::Object(map) => map,
            _ => panic!("not a mapping"),
        }
    }

    #[test]
    fn test_nested_mappings_combine() {
        let merged = merge_all(&[m(json!({"a": {"x": 1}})), m(json!({"a": {"y": 2}}))]);
        assert_eq!(Value::Object(merged), json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_mapping_replaces_scalar() {
        let merged = merge_all(&[m(json!({"a": 1})), m(json!({"a": {"y": 2}}))]);
        assert_eq!(Value::Object(merged), json!({"a": {"y": 2}}));
    }

    #[test]
    fn test_scalar_replaces_mapping() {
        let merged = merge_all(&[m(json!({"a": {"y": 2}})), m(json!({"a": 3}))]);
        assert_eq!(Value::Object(merged), json!({"a": 3}));
    }

    #[test]
    fn test_sequences_replace() {
        let merged = merge_all(&[m(json!({"l": [1, 2, 3]})), m(json!({"l": [9]}))]);
        assert_eq!(Value::Object(merged), json!({"l": [9]}));
    }

    #[test]
    fn test_null_overrides() {
        let merged = merge_all(&[m(json!({"a": 1})), m(json!({"a": null}))]);
        assert!(merged["a"].is_null());
    }

    #[test]
    fn test_associative_per_key_path() {
        let a = m(json!({"k": {"x": 1, "y": {"p": 1}}, "s": 1}));
        let b = m(json!({"k": {"y": {"q": 2}}, "s": {"deep": true}}));
        let c = m(json!({"k": {"x": 3, "y": {"p": 4}}, "t": [1]}));

        let left = merge_all(&[a.clone(), b.clone(), c.clone()]);
        let bc = merge_all(&[b, c]);
        let right = merge_all(&[a, bc]);
        assert_eq!(left, right);
    }

    #[test]
    fn test_inputs_not_mutated() {
        let a = m(json!({"k": {"x": 1}}));
        let b = m(json!({"k": {"y": 2}}));
        let _ = merge_all(&[a.clone(), b.clone()]);
        assert_eq!(Value::Object(a), json!({"k": {"x": 1}}));
        assert_eq!(Value::Object(b), json!({"k": {"y": 2}}));
    }

    #[test]
    fn test_merge_all_empty_is_empty() {
        assert!(merge_all(std::iter::empty::<&Mapping>()).is_empty());
    }

    #[test]
    fn test_flatten_and_get() {
        let map = m(json!({"a": {"b": {"c": 1}, "d": [1, 2]}, "e": "x", "f": {}}));
        let flat: Vec<String> = flatten(&map).into_iter().map(|(k, _)| k).collect();
        assert_eq!(flat, vec!["a.b.c", "a.d", "e"]);
        assert_eq!(get_dotted(&map, "a.b.c"), Some(&json!(1)));
        assert_eq!(get_dotted(&map, "a.b.zzz"), None);
        assert_eq!(get_dotted(&map, "e.x"), None);
    }

    #[test]
    fn test_set_dotted_creates_and_replaces() {
        let mut map = m(json!({"a": {"b": 1}, "s": 5}));
        set_dotted(&mut map, "a.c", json!(2));
        set_dotted(&mut map, "s.t", json!(3));
        set_dotted(&mut map, "n.m.o", json!("deep"));
        assert_eq!(
            Value::Object(map),
            json!({"a": {"b": 1, "c": 2}, "s": {"t": 3}, "n": {"m": {"o": "deep"}}})
        );
    }
}
