//! Config merging
//!
//! Files are merged in load order:
//! 1. /etc/cloud/cloud.cfg (base)
//! 2. /etc/cloud/cloud.cfg.d/*.cfg (sorted alphabetically)
//!
//! Mappings merge key by key; any other value in a later file replaces the
//! earlier one.

use serde_yaml::Value;

/// Merge `overlay` on top of `base`
pub fn merge_yaml_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.get(key) {
                    Some(base_value) => merge_yaml_values(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }
            Value::Mapping(result)
        }
        // An empty document leaves the base untouched
        (_, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// Merge a sequence of documents in order
pub fn merge_all(values: &[Value]) -> Value {
    values
        .iter()
        .fold(Value::Null, |acc, value| merge_yaml_values(&acc, value))
}
