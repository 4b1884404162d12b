//! Deep-merge primitives over nested documents
//!
//! Documents are `serde_json::Value` trees. Helpers here create intermediate
//! maps on demand but refuse to overwrite a non-map value that sits on a path,
//! so a structurally unexpected base manifest fails the merge instead of being
//! silently rewritten.

use serde_json::{Map, Value};

use meshkeeper_common::quantity::parse_quantity;
use meshkeeper_common::{Error, Result};

/// Merge `overlay` into `base`, with `overlay` winning
///
/// Maps are merged key by key, recursively. Any other overlay value (scalar or
/// list) replaces the base value. Null overlay values are ignored, so an empty
/// overlay is a no-op.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        if !overlay_value.is_null() {
                            base_map.insert(key.clone(), overlay_value.clone());
                        }
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Walk `path` from `root`, creating empty maps for missing or null segments
///
/// Fails if an existing non-map value is found on the path.
pub fn object_at<'a>(root: &'a mut Value, path: &[&str]) -> Result<&'a mut Map<String, Value>> {
    let mut current = root;
    let mut walked = Vec::with_capacity(path.len());
    for segment in path {
        let map = as_object_mut(current, &walked)?;
        walked.push(*segment);
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object_mut(current, &walked)
}

/// The first element of the list at `path`, appending an empty map if the list is empty
///
/// Used for component lists such as `ingressGateways` where the first entry is
/// the default gateway.
pub fn first_list_item<'a>(
    root: &'a mut Value,
    path: &[&str],
) -> Result<&'a mut Map<String, Value>> {
    let (last, parent_path) = path
        .split_last()
        .ok_or_else(|| Error::manifest_with_context("merge", "empty list path"))?;
    let parent = object_at(root, parent_path)?;
    let list = parent
        .entry(last.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if list.is_null() {
        *list = Value::Array(Vec::new());
    }
    let items = list.as_array_mut().ok_or_else(|| {
        Error::manifest_with_context("merge", format!("{} is not a list", path.join(".")))
    })?;
    if items.is_empty() {
        items.push(Value::Object(Map::new()));
    }
    let joined = path.join(".");
    as_object_mut(&mut items[0], &[joined.as_str(), "0"])
}

/// The list stored under `key`, created if missing
pub fn list_at<'a>(map: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Vec<Value>> {
    let list = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if list.is_null() {
        *list = Value::Array(Vec::new());
    }
    list.as_array_mut()
        .ok_or_else(|| Error::manifest_with_context("merge", format!("{key} is not a list")))
}

/// The map stored under `key`, created if missing
pub fn child_object<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>> {
    let child = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    as_object_mut(child, &[key])
}

/// Read the value at `path`, if every segment exists
pub fn get_path<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| current.get(*segment))
}

/// Set `key` in `map` only when `value` is present
pub fn set_if_present<T: Into<Value> + Clone>(
    map: &mut Map<String, Value>,
    key: &str,
    value: Option<&T>,
) {
    if let Some(value) = value {
        map.insert(key.to_string(), value.clone().into());
    }
}

/// Set or overwrite an `{name, value}` entry in a list of env vars
pub fn upsert_env(env: &mut Vec<Value>, name: &str, value: &str) {
    let existing = env
        .iter_mut()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name));
    match existing {
        Some(entry) => {
            if let Some(map) = entry.as_object_mut() {
                map.insert("value".to_string(), Value::String(value.to_string()));
            }
        }
        None => env.push(serde_json::json!({ "name": name, "value": value })),
    }
}

/// Parse a quantity string and return it as a document value
///
/// The original spelling is kept; parsing only guards against invalid input.
pub fn quantity_value(raw: &str) -> Result<Value> {
    let quantity = parse_quantity(raw)?;
    Ok(Value::String(quantity.as_str().to_string()))
}

fn as_object_mut<'a>(value: &'a mut Value, path: &[&str]) -> Result<&'a mut Map<String, Value>> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        Error::manifest_with_context(
            "merge",
            format!("expected a mapping at '{}'", path.join(".")),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==========================================================================
    // deep_merge
    // ==========================================================================

    #[test]
    fn overlay_wins_for_scalars() {
        let mut base = json!({"a": 1, "b": {"c": "x", "d": true}});
        deep_merge(&mut base, &json!({"b": {"c": "y"}}));
        assert_eq!(base, json!({"a": 1, "b": {"c": "y", "d": true}}));
    }

    #[test]
    fn overlay_adds_missing_keys() {
        let mut base = json!({"spec": {}});
        deep_merge(
            &mut base,
            &json!({"spec": {"values": {"cni": {"cniBinDir": "/bin"}}}}),
        );
        assert_eq!(base["spec"]["values"]["cni"]["cniBinDir"], "/bin");
    }

    #[test]
    fn lists_are_replaced_not_appended() {
        let mut base = json!({"list": [1, 2, 3]});
        deep_merge(&mut base, &json!({"list": [9]}));
        assert_eq!(base, json!({"list": [9]}));
    }

    #[test]
    fn empty_and_null_overlays_are_no_ops() {
        let original = json!({"a": {"b": [1, {"c": null}]}});
        let mut base = original.clone();
        deep_merge(&mut base, &json!({}));
        deep_merge(&mut base, &Value::Null);
        deep_merge(&mut base, &json!({"a": null, "z": null}));
        assert_eq!(base, original);
    }

    #[test]
    fn map_replaces_scalar() {
        let mut base = json!({"a": "scalar"});
        deep_merge(&mut base, &json!({"a": {"b": 1}}));
        assert_eq!(base, json!({"a": {"b": 1}}));
    }

    // ==========================================================================
    // Path helpers
    // ==========================================================================

    #[test]
    fn object_at_creates_path() {
        let mut doc = json!({});
        object_at(&mut doc, &["spec", "meshConfig"])
            .unwrap()
            .insert("trustDomain".into(), json!("cluster.local"));
        assert_eq!(doc["spec"]["meshConfig"]["trustDomain"], "cluster.local");
    }

    #[test]
    fn object_at_replaces_null() {
        let mut doc = json!({"spec": null});
        assert!(object_at(&mut doc, &["spec", "values"]).is_ok());
        assert!(doc["spec"]["values"].is_object());
    }

    #[test]
    fn object_at_rejects_scalar_on_path() {
        let mut doc = json!({"spec": {"meshConfig": "oops"}});
        let err = object_at(&mut doc, &["spec", "meshConfig", "defaultConfig"]).unwrap_err();
        assert!(err.to_string().contains("spec.meshConfig"));
    }

    #[test]
    fn first_list_item_creates_entry() {
        let mut doc = json!({"spec": {"components": {}}});
        first_list_item(&mut doc, &["spec", "components", "ingressGateways"])
            .unwrap()
            .insert("name".into(), json!("istio-ingressgateway"));
        assert_eq!(
            doc["spec"]["components"]["ingressGateways"],
            json!([{"name": "istio-ingressgateway"}])
        );
    }

    #[test]
    fn first_list_item_keeps_existing() {
        let mut doc = json!({"gw": [{"name": "a"}, {"name": "b"}]});
        let first = first_list_item(&mut doc, &["gw"]).unwrap();
        assert_eq!(first["name"], "a");
    }

    #[test]
    fn first_list_item_rejects_non_list() {
        let mut doc = json!({"gw": {"name": "a"}});
        assert!(first_list_item(&mut doc, &["gw"]).is_err());
    }

    #[test]
    fn get_path_reads_nested() {
        let doc = json!({"a": {"b": {"c": 3}}});
        assert_eq!(get_path(&doc, &["a", "b", "c"]), Some(&json!(3)));
        assert_eq!(get_path(&doc, &["a", "x"]), None);
    }

    #[test]
    fn set_if_present_skips_none() {
        let mut map = Map::new();
        set_if_present::<u32>(&mut map, "absent", None);
        set_if_present(&mut map, "zero", Some(&0u32));
        assert!(!map.contains_key("absent"));
        assert_eq!(map["zero"], 0);
    }

    #[test]
    fn upsert_env_overwrites_by_name() {
        let mut env = vec![json!({"name": "A", "value": "1"})];
        upsert_env(&mut env, "A", "2");
        upsert_env(&mut env, "B", "3");
        assert_eq!(
            env,
            vec![
                json!({"name": "A", "value": "2"}),
                json!({"name": "B", "value": "3"})
            ]
        );
    }

    #[test]
    fn quantity_value_validates() {
        assert_eq!(quantity_value("100m").unwrap(), json!("100m"));
        assert!(quantity_value("many").is_err());
    }
}
