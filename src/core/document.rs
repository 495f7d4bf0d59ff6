// src/core/document.rs

//! The configuration document model: a tree of scalar/sequence/mapping
//! values (plain YAML), `__file` inlining, and null-sentinel patch merging.

use crate::core::errors::AppError;
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::warn;

/// A configuration document is just a YAML value. The top level is expected
/// to be a mapping with (at minimum) `topology` and `vshard` sections; any
/// other top-level key is a role-owned section, opaque to the core.
pub type Doc = Value;

/// Recursively replaces every mapping node whose sole key is `__file` with
/// the raw contents of the referenced file, resolved relative to `base_dir`.
///
/// Cycles are impossible: the marker node holds a path string, never a
/// reference back into the tree.
pub fn inline_files(value: Value, base_dir: &Path) -> Result<Value, AppError> {
    match value {
        Value::Mapping(map) => {
            if map.len() == 1 {
                if let Some(Value::String(rel)) = map.get(Value::String("__file".to_string())) {
                    let path = base_dir.join(rel);
                    let contents = std::fs::read_to_string(&path).map_err(|e| {
                        AppError::ConfigLoad(format!(
                            "failed to inline '{}' referenced as __file: {e}",
                            path.display()
                        ))
                    })?;
                    return Ok(Value::String(contents));
                }
            }
            let mut out = Mapping::new();
            for (k, v) in map {
                out.insert(k, inline_files(v, base_dir)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(|v| inline_files(v, base_dir))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}

/// Applies a clusterwide patch to a deep copy of `base`. Top-level keys
/// present in `patch` replace the corresponding key in `base`; an explicit
/// YAML `null` removes that top-level key. Absence of a key in `patch`
/// leaves the base value for that key unchanged.
pub fn merge_patch(base: &Value, patch: &Mapping) -> Result<Value, AppError> {
    let Value::Mapping(base_map) = base else {
        return Err(AppError::ConfigValidate(
            "active config is not a mapping".into(),
        ));
    };
    let mut result = base_map.clone();
    for (key, value) in patch {
        if value.is_null() {
            result.shift_remove(key);
        } else {
            result.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Mapping(result))
}

/// Fetches a top-level section by name, if present.
pub fn section<'a>(doc: &'a Value, name: &str) -> Option<&'a Value> {
    doc.as_mapping()?.get(Value::String(name.to_string()))
}

/// Parses a mapping-shaped YAML document from a human-authored string (e.g.
/// the body of a `clusterconfctl patch` invocation). Unlike `section`, this
/// does not run `__file` inlining, since patches are expected to carry
/// literal values.
pub fn parse_patch(yaml: &str) -> Result<Mapping, AppError> {
    let value: Value = serde_yaml::from_str(yaml)?;
    match value {
        Value::Mapping(m) => Ok(m),
        _ => Err(AppError::ConfigValidate(
            "patch document must be a mapping".into(),
        )),
    }
}

/// Warns (once per call site) when a document doesn't contain a mandatory
/// top-level section, used by callers that want a soft diagnostic before the
/// hard validator rejects it.
pub fn warn_if_missing(doc: &Value, name: &str) {
    if section(doc, name).is_none() {
        warn!("document is missing the '{}' top-level section", name);
    }
}
