use serde_json::{Map, Value};

/// Deep-merge a patch into a world-model blob.
///
/// Rules: keys absent from the patch are preserved; the `provenance` list is
/// concatenated, never replaced; object values merge shallowly per section
/// (new subkeys added, existing subkeys overwritten); everything else
/// replaces the current value.
pub fn deep_merge_model(current: &Value, patch: &Value) -> Value {
    let mut merged: Map<String, Value> = current.as_object().cloned().unwrap_or_default();
    let Some(patch_object) = patch.as_object() else {
        return Value::Object(merged);
    };

    for (key, value) in patch_object {
        if key == "provenance" {
            let mut entries = merged
                .get("provenance")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if let Some(additions) = value.as_array() {
                entries.extend(additions.iter().cloned());
            }
            merged.insert(key.clone(), Value::Array(entries));
            continue;
        }

        match (value.as_object(), merged.get(key).and_then(|v| v.as_object())) {
            (Some(patch_section), Some(current_section)) => {
                let mut section = current_section.clone();
                for (sub_key, sub_value) in patch_section {
                    section.insert(sub_key.clone(), sub_value.clone());
                }
                merged.insert(key.clone(), Value::Object(section));
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(merged)
}

/// Append an entry to the blob's internal `provenance` array, creating the
/// array if needed.
pub fn push_model_provenance(model_data: &mut Value, entry: Value) {
    if !model_data.is_object() {
        *model_data = Value::Object(Map::new());
    }
    if let Some(object) = model_data.as_object_mut() {
        let entries = object
            .entry("provenance".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(array) = entries.as_array_mut() {
            array.push(entry);
        } else {
            *entries = Value::Array(vec![entry]);
        }
    }
}
