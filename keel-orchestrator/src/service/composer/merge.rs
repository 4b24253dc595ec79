//! JSON merge patch (RFC 7386)
//!
//! Objects merge key by key, `null` deletes, everything else (arrays
//! included) replaces.

use serde_json::Value;

use crate::error::ComposerError;

/// Applies `patch` onto `target`. Both roots must be objects; `layer` names
/// the patch in errors.
pub fn apply(target: &mut Value, patch: &Value, layer: &str) -> Result<(), ComposerError> {
    if !target.is_object() {
        return Err(ComposerError::merge("$", "values document root is not an object"));
    }
    if !patch.is_object() {
        return Err(ComposerError::merge(
            "$",
            format!("{} is not a JSON object", layer),
        ));
    }
    merge_patch(target, patch);
    Ok(())
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rfc7386_semantics() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}, "list": [1, 2]});
        let patch = json!({"a": "z", "c": {"f": null}, "list": [3]});
        apply(&mut target, &patch, "patch").unwrap();
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}, "list": [3]}));
    }

    #[test]
    fn test_object_replaces_scalar() {
        let mut target = json!({"a": 1});
        apply(&mut target, &json!({"a": {"b": null, "c": 2}}), "patch").unwrap();
        assert_eq!(target, json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_non_object_patch_is_merge_error() {
        let mut target = json!({});
        let err = apply(&mut target, &json!([1]), "additional override").unwrap_err();
        match err {
            ComposerError::Merge { path, message } => {
                assert_eq!(path, "$");
                assert!(message.contains("additional override"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
