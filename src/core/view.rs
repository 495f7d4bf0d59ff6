// src/core/view.rs

//! View Layer (spec §4.C): hands out read-only and deep-copy snapshots of
//! the active config.
//!
//! Grounded in the spec's design note "read-only proxy via prototype swap":
//! since Rust has no dynamic property interception, the read-only guarantee
//! is enforced by never exposing `&mut` through this type at all — any
//! attempted "write" goes through `set`, which always raises.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use std::sync::Arc;

/// A frozen snapshot of the active config. Cloning is cheap (`Arc`).
/// There is no mutation API beyond `set`, which always fails: this is the
/// "attempting to set any key raises immediately and terminally" contract
/// from spec §4.C, enforced at the type level rather than at every depth of
/// a nested structure.
#[derive(Debug, Clone)]
pub struct ReadOnlyView {
    inner: Arc<Doc>,
}

impl ReadOnlyView {
    pub fn new(doc: Doc) -> Self {
        ReadOnlyView { inner: Arc::new(doc) }
    }

    pub fn get(&self) -> &Doc {
        &self.inner
    }

    pub fn section(&self, name: &str) -> Option<&serde_yaml::Value> {
        crate::core::document::section(&self.inner, name)
    }

    /// Any attempt to mutate a read-only view raises a terminal error.
    pub fn set(&self, _key: &str, _value: serde_yaml::Value) -> Result<(), AppError> {
        Err(AppError::ConfigValidate(
            "attempted to mutate a read-only configuration view".into(),
        ))
    }
}

/// An independently owned, mutable copy of the active config (or one
/// section of it).
#[derive(Debug, Clone)]
pub struct DeepCopyView {
    doc: Doc,
}

impl DeepCopyView {
    pub fn new(doc: Doc) -> Self {
        DeepCopyView { doc }
    }

    pub fn get(&self) -> &Doc {
        &self.doc
    }

    pub fn get_mut(&mut self) -> &mut Doc {
        &mut self.doc
    }

    pub fn into_inner(self) -> Doc {
        self.doc
    }
}

/// `get_readonly([section])`.
pub fn get_readonly(active: &Doc, section: Option<&str>) -> Result<ReadOnlyView, AppError> {
    match section {
        None => Ok(ReadOnlyView::new(active.clone())),
        Some(name) => {
            let value = crate::core::document::section(active, name).ok_or_else(|| {
                AppError::ConfigValidate(format!("no such section '{name}'"))
            })?;
            Ok(ReadOnlyView::new(value.clone()))
        }
    }
}

/// `get_deepcopy([section])`.
pub fn get_deepcopy(active: &Doc, section: Option<&str>) -> Result<DeepCopyView, AppError> {
    match section {
        None => Ok(DeepCopyView::new(active.clone())),
        Some(name) => {
            let value = crate::core::document::section(active, name).ok_or_else(|| {
                AppError::ConfigValidate(format!("no such section '{name}'"))
            })?;
            Ok(DeepCopyView::new(value.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_rejects_any_write() {
        let doc: Doc = serde_yaml::from_str("a: 1\n").unwrap();
        let view = get_readonly(&doc, None).unwrap();
        assert!(view.set("a", serde_yaml::Value::from(2)).is_err());
    }

    #[test]
    fn deepcopy_is_independent_of_active() {
        let doc: Doc = serde_yaml::from_str("a: 1\n").unwrap();
        let mut copy = get_deepcopy(&doc, None).unwrap();
        if let Some(map) = copy.get_mut().as_mapping_mut() {
            map.insert(
                serde_yaml::Value::String("a".into()),
                serde_yaml::Value::from(99),
            );
        }
        assert_eq!(doc.get("a").unwrap().as_i64(), Some(1));
        assert_eq!(copy.get().get("a").unwrap().as_i64(), Some(99));
    }

    #[test]
    fn section_scoped_views() {
        let doc: Doc = serde_yaml::from_str("topology:\n  failover: true\nvshard:\n  bucket_count: 10\n  bootstrapped: false\n").unwrap();
        let view = get_readonly(&doc, Some("topology")).unwrap();
        assert_eq!(
            view.get().get("failover").unwrap().as_bool(),
            Some(true)
        );
    }
}
