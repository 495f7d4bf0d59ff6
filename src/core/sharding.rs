// src/core/sharding.rs

//! The built-in storage/router sharding service is an external collaborator
//! per spec §1; this module carries only its contract (`cfg`/`current_cfg`)
//! plus a logging mock, since the real sharding engine is out of scope.

use crate::core::errors::AppError;
use crate::core::topology::ReplicasetShardingEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::info;

pub type ShardingConfig = BTreeMap<String, ReplicasetShardingEntry>;

/// A sharding service (storage or router side). `cfg` installs a new
/// sharding map; `current_cfg` introspects what's installed, used by the
/// failover worker to diff against the newly computed config.
#[async_trait]
pub trait ShardingService: Send + Sync {
    async fn cfg(&self, config: ShardingConfig, bucket_count: u64) -> Result<(), AppError>;
    fn current_cfg(&self) -> Option<ShardingConfig>;
}

/// Logs every call and remembers the last-installed config; stands in for
/// the real vshard storage/router engine.
pub struct LoggingShardingService {
    name: &'static str,
    installed: Mutex<Option<ShardingConfig>>,
}

impl LoggingShardingService {
    pub fn new(name: &'static str) -> Self {
        LoggingShardingService {
            name,
            installed: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ShardingService for LoggingShardingService {
    async fn cfg(&self, config: ShardingConfig, bucket_count: u64) -> Result<(), AppError> {
        info!(
            service = self.name,
            bucket_count,
            replicasets = config.len(),
            "installing sharding configuration"
        );
        *self.installed.lock() = Some(config);
        Ok(())
    }

    fn current_cfg(&self) -> Option<ShardingConfig> {
        self.installed.lock().clone()
    }
}
