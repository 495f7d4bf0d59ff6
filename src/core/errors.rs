// src/core/errors.rs

//! Defines the primary error type for the applier.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the applier.
///
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations, the way the rest of this codebase's error types do.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// File I/O, YAML parse, or `__file` inlining failure while loading a
    /// configuration document.
    #[error("config load failed: {0}")]
    ConfigLoad(String),

    /// A peer RPC failed while fetching the active config during bootstrap.
    /// The caller is expected to retry.
    #[error("config fetch failed: {0}")]
    ConfigFetch(String),

    /// Structural or role-level validation rejected a document. Aborts the
    /// 2PC round before the prepare phase.
    #[error("config validation failed: {0}")]
    ConfigValidate(String),

    /// The local apply pipeline, the commit rename, or a peer commit call
    /// failed. May leave the cluster partially committed.
    #[error("config apply failed: {0}")]
    ConfigApply(String),

    /// Reserved for manual rollback tooling.
    #[error("rollback failed: {0}")]
    Rollback(String),

    /// A failover worker iteration failed. Logged, the worker continues.
    #[error("failover step failed: {0}")]
    Failover(String),

    /// A `patch_clusterwide` call was attempted while one was already in
    /// flight on this instance.
    #[error("a clusterwide operation is already in progress")]
    Atomic,

    /// A role was registered twice, or a role descriptor could not be loaded.
    #[error("role registration failed: {0}")]
    RegisterRole(String),
}

// `std::io::Error` isn't `Clone`, but views/errors returned from this crate
// are cloned freely (e.g. stored as "first error wins" across a 2PC round),
// so I/O failures are flattened to a message at the boundary instead of kept
// as a typed source.
impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::ConfigLoad(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::ConfigLoad(format!("YAML error: {e}"))
    }
}

impl From<Arc<AppError>> for AppError {
    fn from(e: Arc<AppError>) -> Self {
        (*e).clone()
    }
}

pub type AppResult<T> = Result<T, AppError>;
