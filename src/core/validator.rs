// src/core/validator.rs

//! Validator (spec §4.D): structural checks plus dispatch to each role's
//! `validate_config` hook.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use crate::core::roles::RoleRegistry;
use crate::core::topology;

/// `validate(conf_new, conf_old)`.
///
/// 1. `conf_new` must be a mapping with a well-formed `vshard` section.
/// 2. Dispatch to `topology::validate`.
/// 3. Call every registered role's `validate_config` in registration order;
///    first failure aborts.
pub fn validate(conf_new: &Doc, conf_old: Option<&Doc>, roles: &RoleRegistry) -> Result<(), AppError> {
    if conf_new.as_mapping().is_none() {
        return Err(AppError::ConfigValidate("document must be a mapping".into()));
    }
    topology::get_vshard(conf_new)?;

    let new_topology = topology::get(conf_new)?;
    let old_topology = conf_old.map(topology::get).transpose()?;
    let known_roles: Vec<String> = roles.get_known_roles();
    topology::validate(&new_topology, old_topology.as_ref(), &known_roles)?;

    let mut first_err: Option<AppError> = None;
    roles.for_each(|name, role| {
        if first_err.is_some() {
            return;
        }
        if let Err(e) = role.validate_config(conf_new, conf_old) {
            first_err = Some(AppError::ConfigValidate(format!("role '{name}': {e}")));
        }
    });
    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(())
}
