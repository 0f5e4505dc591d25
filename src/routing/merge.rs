//! Deep merge of JSON responses

use serde_json::Value;

/// Deep-merge `source` into `target`; fields already in `target` win
///
/// Objects merge recursively. Any other collision keeps the target value.
pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_wins_on_collision() {
        let mut target = json!({"name": "General", "beds": 10});
        deep_merge(&mut target, &json!({"name": "County", "phone": "555"}));
        assert_eq!(target, json!({"name": "General", "beds": 10, "phone": "555"}));
    }

    #[test]
    fn test_nested_objects_merge() {
        let mut target = json!({"address": {"city": "Austin"}});
        deep_merge(&mut target, &json!({"address": {"city": "Dallas", "zip": "78701"}}));
        assert_eq!(target, json!({"address": {"city": "Austin", "zip": "78701"}}));
    }

    #[test]
    fn test_arrays_are_not_concatenated() {
        let mut target = json!({"ids": [1]});
        deep_merge(&mut target, &json!({"ids": [2, 3]}));
        assert_eq!(target, json!({"ids": [1]}));
    }
}
