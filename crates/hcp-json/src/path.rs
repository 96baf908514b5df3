// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dotted-path operations over [`serde_json::Value`].
//!
//! Paths are `"."` (the root) or `".node1.node2..."`. Node names are
//! limited to `[A-Za-z0-9_<>-]`; empty nodes are rejected. Traversal of a
//! non-object at an intermediate node counts as a miss, never an error.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by path validation and must-exist extraction.
#[derive(Debug, Error)]
pub enum PathError {
    /// The path does not start with `.` where a node was expected.
    #[error("path nodes must begin with '.': {0}")]
    MissingDot(String),

    /// A path node was empty (`..` or a trailing `.`).
    #[error("path nodes must be non-empty: {0}")]
    EmptyNode(String),

    /// A path node contained a character outside `[A-Za-z0-9_<>-]`.
    #[error("invalid path node: {0}")]
    InvalidNode(String),

    /// Must-exist extraction found nothing at the path.
    #[error("no value at path: {0}")]
    NoSuchPath(String),
}

fn valid_node_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '<' | '>' | '-')
}

/// Split a path into its validated node names. `"."` yields an empty list.
pub fn split_path(path: &str) -> Result<Vec<&str>, PathError> {
    if path == "." {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('.') else {
        return Err(PathError::MissingDot(path.to_string()));
    };
    let mut nodes = Vec::new();
    for node in rest.split('.') {
        if node.is_empty() {
            return Err(PathError::EmptyNode(path.to_string()));
        }
        if !node.chars().all(valid_node_char) {
            return Err(PathError::InvalidNode(node.to_string()));
        }
        nodes.push(node);
    }
    Ok(nodes)
}

/// Validate a path without traversing anything.
pub fn valid_path(path: &str) -> Result<(), PathError> {
    split_path(path).map(|_| ())
}

/// Extract the value at `path`, or `None` if any node along the way is
/// missing (or the intermediate value is not an object).
pub fn extract_path<'a>(data: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    let nodes = split_path(path)?;
    let mut cur = data;
    for node in nodes {
        match cur.as_object().and_then(|m| m.get(node)) {
            Some(next) => cur = next,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

/// Extract the value at `path`, erroring if it is absent.
pub fn extract_path_must(data: &Value, path: &str) -> Result<Value, PathError> {
    extract_path(data, path)?
        .cloned()
        .ok_or_else(|| PathError::NoSuchPath(path.to_string()))
}

/// Write `value` at `path`, creating missing intermediate objects and
/// replacing intermediate non-objects with fresh objects.
pub fn overwrite_path(data: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let nodes = split_path(path)?;
    if nodes.is_empty() {
        *data = value;
        return Ok(());
    }
    let mut cur = data;
    for node in &nodes[..nodes.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        cur = cur
            .as_object_mut()
            .expect("just coerced to object")
            .entry(node.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    let last = nodes[nodes.len() - 1];
    cur.as_object_mut()
        .expect("just coerced to object")
        .insert(last.to_string(), value);
    Ok(())
}

/// Remove the value at `path`. A missing path is a successful no-op;
/// deleting `"."` resets the root to an empty object.
pub fn delete_path(data: &mut Value, path: &str) -> Result<(), PathError> {
    let nodes = split_path(path)?;
    if nodes.is_empty() {
        *data = Value::Object(Map::new());
        return Ok(());
    }
    let mut cur = data;
    for node in &nodes[..nodes.len() - 1] {
        match cur.as_object_mut().and_then(|m| m.get_mut(*node)) {
            Some(next) => cur = next,
            None => return Ok(()),
        }
    }
    if let Some(m) = cur.as_object_mut() {
        m.remove(nodes[nodes.len() - 1]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_and_validates() {
        assert!(split_path(".").unwrap().is_empty());
        assert_eq!(split_path(".a.b-c.d_e").unwrap(), vec!["a", "b-c", "d_e"]);
        assert!(matches!(split_path("a.b"), Err(PathError::MissingDot(_))));
        assert!(matches!(split_path(".a..b"), Err(PathError::EmptyNode(_))));
        assert!(matches!(split_path(".a!"), Err(PathError::InvalidNode(_))));
    }

    #[test]
    fn extracts_nested_values() {
        let d = json!({"a": {"b": {"c": 7}}});
        assert_eq!(extract_path(&d, ".a.b.c").unwrap(), Some(&json!(7)));
        assert_eq!(extract_path(&d, ".").unwrap(), Some(&d));
        assert_eq!(extract_path(&d, ".a.x").unwrap(), None);
        // Traversing through a non-object is a miss, not an error.
        assert_eq!(extract_path(&d, ".a.b.c.d").unwrap(), None);
    }

    #[test]
    fn must_exist_errors_on_miss() {
        let d = json!({"a": 1});
        assert!(extract_path_must(&d, ".a").is_ok());
        assert!(matches!(
            extract_path_must(&d, ".b"),
            Err(PathError::NoSuchPath(_))
        ));
    }

    #[test]
    fn overwrite_creates_intermediates() {
        let mut d = json!({});
        overwrite_path(&mut d, ".a.b.c", json!(1)).unwrap();
        assert_eq!(d, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn overwrite_replaces_non_object_intermediates() {
        let mut d = json!({"a": 42});
        overwrite_path(&mut d, ".a.b", json!("x")).unwrap();
        assert_eq!(d, json!({"a": {"b": "x"}}));
    }

    #[test]
    fn overwrite_root_replaces_everything() {
        let mut d = json!({"a": 1});
        overwrite_path(&mut d, ".", json!([1, 2])).unwrap();
        assert_eq!(d, json!([1, 2]));
    }

    #[test]
    fn delete_is_noop_on_missing() {
        let mut d = json!({"a": {"b": 1}});
        delete_path(&mut d, ".x.y").unwrap();
        assert_eq!(d, json!({"a": {"b": 1}}));
        delete_path(&mut d, ".a.b").unwrap();
        assert_eq!(d, json!({"a": {}}));
    }

    #[test]
    fn delete_root_yields_empty_object() {
        let mut d = json!({"a": 1});
        delete_path(&mut d, ".").unwrap();
        assert_eq!(d, json!({}));
    }

    #[test]
    fn overwrite_then_extract_round_trips() {
        let mut d = json!({"a": {"b": 2}});
        let v = extract_path(&d, ".a.b").unwrap().cloned().unwrap();
        let before = d.clone();
        overwrite_path(&mut d, ".a.b", v).unwrap();
        assert_eq!(d, before);
    }

    #[test]
    fn delete_then_extract_misses() {
        let mut d = json!({"a": {"b": 2}});
        delete_path(&mut d, ".a.b").unwrap();
        assert_eq!(extract_path(&d, ".a.b").unwrap(), None);
    }
}
