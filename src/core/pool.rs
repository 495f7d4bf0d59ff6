// src/core/pool.rs

//! Pool (spec §6 "services consumed"): the connection-pool external
//! collaborator, `connect(uri) -> conn`. The real pool is out of scope; this
//! crate's RPC-backed implementation lives in `core::rpc`.

use crate::core::errors::AppError;
use crate::core::rpc::RpcConn;
use async_trait::async_trait;

#[async_trait]
pub trait Pool: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<RpcConn, AppError>;
}

/// Connects directly over TCP on each call; no actual pooling of
/// connections, matching the spec's silence on pool internals — it is named
/// only via its contract.
pub struct TcpPool;

#[async_trait]
impl Pool for TcpPool {
    async fn connect(&self, uri: &str) -> Result<RpcConn, AppError> {
        RpcConn::connect(uri).await
    }
}
