// src/core/roles.rs

//! Role Registry (spec §4.B): the ordered, append-only list of registered
//! roles and their lifecycle hooks.
//!
//! Dynamic dispatch on role modules is modeled as the spec's design notes
//! recommend: an interface with four optional methods, absence a no-op.
//! Rust can't dispatch on a dynamic method name (the "legacy `validate`
//! hook"), so that's a `legacy_validate` flag on the descriptor instead, with
//! a once-per-role `AtomicBool` guarding the deprecation warning.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub const VSHARD_STORAGE: &str = "vshard-storage";
pub const VSHARD_ROUTER: &str = "vshard-router";

/// Context passed to `init`/`apply_config`/`stop` hooks.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOpts {
    pub is_master: bool,
}

/// The four lifecycle hooks a role may implement; all default to no-ops.
#[async_trait]
pub trait Role: Send + Sync {
    fn validate_config(&self, _new: &Doc, _old: Option<&Doc>) -> Result<(), AppError> {
        Ok(())
    }

    async fn init(&self, _opts: ApplyOpts) -> Result<(), AppError> {
        Ok(())
    }

    async fn apply_config(&self, _conf: &Doc, _opts: ApplyOpts) -> Result<(), AppError> {
        Ok(())
    }

    async fn stop(&self, _opts: ApplyOpts) -> Result<(), AppError> {
        Ok(())
    }

    /// True if this role only implements the legacy `validate` hook name
    /// rather than `validate_config`. Triggers a once-per-role warning.
    fn legacy_validate(&self) -> bool {
        false
    }
}

struct RoleEntry {
    name: String,
    role: Arc<dyn Role>,
    warned_legacy: AtomicBool,
}

/// The ordered, append-only registry. Registration order defines apply
/// order; the two vshard pseudo-roles are always present and always sort
/// before user roles.
pub struct RoleRegistry {
    entries: parking_lot::RwLock<Vec<RoleEntry>>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        RoleRegistry {
            entries: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// `register_role(name, role)`: fails with `RegisterRole` on duplicate
    /// name (including either built-in pseudo-role name).
    pub fn register_role(&self, name: impl Into<String>, role: Arc<dyn Role>) -> Result<(), AppError> {
        let name = name.into();
        let mut entries = self.entries.write();
        if name == VSHARD_STORAGE || name == VSHARD_ROUTER || entries.iter().any(|e| e.name == name) {
            return Err(AppError::RegisterRole(format!(
                "role '{name}' is already registered"
            )));
        }
        entries.push(RoleEntry {
            name,
            role,
            warned_legacy: AtomicBool::new(false),
        });
        Ok(())
    }

    /// `get_known_roles()`: ordered list prefixed by the two built-ins.
    pub fn get_known_roles(&self) -> Vec<String> {
        let mut out = vec![VSHARD_STORAGE.to_string(), VSHARD_ROUTER.to_string()];
        out.extend(self.entries.read().iter().map(|e| e.name.clone()));
        out
    }

    pub fn known_roles_set(&self) -> HashSet<String> {
        self.get_known_roles().into_iter().collect()
    }

    /// Iterates user roles (not the vshard pseudo-roles) in registration
    /// order, invoking `f` for each. Warns once per role if it only exposes
    /// the legacy `validate` hook.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<dyn Role>)) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if entry.role.legacy_validate() && !entry.warned_legacy.swap(true, Ordering::Relaxed) {
                warn!(
                    role = entry.name.as_str(),
                    "role uses the legacy 'validate' hook name; rename to 'validate_config'"
                );
            }
            f(&entry.name, &entry.role);
        }
    }

    /// Like `for_each`, but returns an owned, ordered snapshot so callers
    /// can `.await` lifecycle hooks between entries without holding the
    /// registry lock.
    pub fn ordered_entries(&self) -> Vec<(String, Arc<dyn Role>)> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|e| {
                if e.role.legacy_validate() && !e.warned_legacy.swap(true, Ordering::Relaxed) {
                    warn!(
                        role = e.name.as_str(),
                        "role uses the legacy 'validate' hook name; rename to 'validate_config'"
                    );
                }
                (e.name.clone(), e.role.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRole;
    #[async_trait]
    impl Role for NoopRole {}

    #[test]
    fn duplicate_registration_fails() {
        let reg = RoleRegistry::new();
        reg.register_role("my-role", Arc::new(NoopRole)).unwrap();
        let err = reg.register_role("my-role", Arc::new(NoopRole)).unwrap_err();
        assert!(matches!(err, AppError::RegisterRole(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn cannot_shadow_builtin_pseudo_roles() {
        let reg = RoleRegistry::new();
        assert!(reg.register_role(VSHARD_STORAGE, Arc::new(NoopRole)).is_err());
    }

    #[test]
    fn known_roles_prefixed_by_builtins() {
        let reg = RoleRegistry::new();
        reg.register_role("app", Arc::new(NoopRole)).unwrap();
        let known = reg.get_known_roles();
        assert_eq!(known, vec![VSHARD_STORAGE, VSHARD_ROUTER, "app"]);
    }
}
