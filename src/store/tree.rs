//! Helpers for editing an in-memory JSON tree.
//!
//! The tree store never holds `null` or empty objects: writing either removes
//! the node, and parents left empty disappear with it. Arrays are stored as
//! ordinary values.

use serde_json::{Map, Value};

/// Strips `null` and empty objects, recursively. Returns `None` if nothing
/// remains.
pub fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

/// The value below `segments`, if any.
pub fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Replaces (or with `None`, removes) the value below `segments`.
///
/// Scalars standing in the way of a deeper write are replaced by objects.
/// The result is pruned.
pub fn write_at(root: &mut Value, segments: &[String], value: Option<Value>) {
    write_node(root, segments, value.and_then(prune));
    let current = std::mem::take(root);
    *root = prune(current).unwrap_or(Value::Null);
}

fn write_node(node: &mut Value, segments: &[String], value: Option<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value.unwrap_or(Value::Null);
        return;
    };

    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        if rest.is_empty() {
            match value {
                Some(value) => {
                    map.insert(first.clone(), value);
                }
                None => {
                    map.remove(first);
                }
            }
            return;
        }

        match map.get_mut(first) {
            Some(child) => write_node(child, rest, value),
            None if value.is_some() => {
                let mut child = Value::Object(Map::new());
                write_node(&mut child, rest, value);
                map.insert(first.clone(), child);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_prune_removes_nulls_and_empty_objects() {
        let value = json!({"a": null, "b": {}, "c": {"d": null}, "e": 1, "f": []});
        assert_eq!(prune(value), Some(json!({"e": 1, "f": []})));
        assert_eq!(prune(json!({"a": {"b": null}})), None);
        assert_eq!(prune(Value::Null), None);
    }

    #[test]
    fn test_write_creates_intermediate_nodes() {
        let mut root = Value::Null;
        write_at(&mut root, &segs("users/u1"), Some(json!({"name": "Ann"})));
        assert_eq!(root, json!({"users": {"u1": {"name": "Ann"}}}));
        assert_eq!(
            value_at(&root, &segs("users/u1/name")),
            Some(&json!("Ann"))
        );
    }

    #[test]
    fn test_write_replaces_scalar_on_deep_write() {
        let mut root = json!({"a": 5});
        write_at(&mut root, &segs("a/b"), Some(json!(true)));
        assert_eq!(root, json!({"a": {"b": true}}));
    }

    #[test]
    fn test_remove_prunes_empty_parents() {
        let mut root = json!({"users": {"u1": {"name": "Ann"}}, "other": 1});
        write_at(&mut root, &segs("users/u1/name"), None);
        assert_eq!(root, json!({"other": 1}));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut root = json!({"a": 1});
        write_at(&mut root, &segs("b/c"), None);
        assert_eq!(root, json!({"a": 1}));
    }

    #[test]
    fn test_write_root() {
        let mut root = json!({"a": 1});
        write_at(&mut root, &[], Some(json!({"b": 2})));
        assert_eq!(root, json!({"b": 2}));
        write_at(&mut root, &[], None);
        assert_eq!(root, Value::Null);
    }

    #[test]
    fn test_value_at_through_scalar_is_none() {
        let root = json!({"a": 1});
        assert_eq!(value_at(&root, &segs("a/b")), None);
        assert_eq!(value_at(&root, &[]), Some(&root));
    }
}
