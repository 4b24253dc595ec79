//! Dotted-path access into values documents (`a.b.c`)

use serde_json::{Map, Value};

use crate::error::ComposerError;

pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |node, segment| node.as_object()?.get(segment))
}

/// Sets `value` at `path`, creating intermediate objects. A non-object
/// intermediate node is a merge error.
pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<(), ComposerError> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(ComposerError::merge(path, "empty path"));
    };

    let mut node = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let map = node.as_object_mut().ok_or_else(|| {
            ComposerError::merge(segments[..depth].join("."), "expected an object")
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = node
        .as_object_mut()
        .ok_or_else(|| ComposerError::merge(parents.join("."), "expected an object"))?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Reads a numeric leaf, accepting numbers and numeric strings
pub fn get_number(doc: &Value, path: &str) -> Option<f64> {
    match get(doc, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
