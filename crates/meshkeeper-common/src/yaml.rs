//! Reading and writing IstioOperator manifests
//!
//! Manifests are read with yaml-rust2 into a `serde_json::Value`, the single
//! document model the merge engine works on, and written back with
//! serde_yaml. Anything that has no JSON counterpart is rejected with the
//! key path where it was found.

use std::fmt;

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse an installation manifest, requiring a mapping at the root
///
/// Only the first document of a multi-document stream is read.
pub fn parse_manifest(input: &str) -> Result<Value> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::manifest_with_context("parse", e.to_string()))?;
    let Some(root) = docs.into_iter().next() else {
        return Err(Error::manifest_with_context("parse", "manifest is empty"));
    };
    match to_value(root, &mut Vec::new())? {
        doc @ Value::Object(_) => Ok(doc),
        _ => Err(Error::manifest_with_context(
            "parse",
            "manifest root must be a mapping",
        )),
    }
}

/// Serialize a document back to YAML
pub fn to_yaml(doc: &Value) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::serialization_for_kind("yaml", e.to_string()))
}

fn to_value(node: Yaml, path: &mut Vec<String>) -> Result<Value> {
    let value = match node {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::from(i),
        Yaml::Real(text) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| unsupported(path, format_args!("'{text}' is not a finite number")))?,
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                path.push(index.to_string());
                list.push(to_value(item, path)?);
                path.pop();
            }
            Value::Array(list)
        }
        Yaml::Hash(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, item) in entries {
                let key = match key {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    _ => return Err(unsupported(path, "non-scalar mapping key")),
                };
                path.push(key.clone());
                let value = to_value(item, path)?;
                path.pop();
                map.insert(key, value);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) => return Err(unsupported(path, "alias")),
        Yaml::BadValue => return Err(unsupported(path, "malformed value")),
    };
    Ok(value)
}

fn unsupported(path: &[String], what: impl fmt::Display) -> Error {
    let at = if path.is_empty() {
        "the root".to_string()
    } else {
        path.join(".")
    };
    Error::manifest_with_context("parse", format!("{what} at {at}"))
}
