// src/core/membership.rs

//! Membership is an external collaborator per spec §1 (the gossip/liveness
//! layer), represented here as a trait contract plus one concrete
//! in-process implementation good enough to drive the bootstrap (S6) and
//! failover (S5) test scenarios without a real gossip protocol.
//!
//! Grounded in the teacher's `cluster::state` node table (a `DashMap` of
//! peer records updated by gossip merge), generalized from cluster-node
//! liveness to the simpler `{uri, uuid, alive, error}` shape this applier
//! needs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One membership entry as seen from this instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberInfo {
    pub uri: String,
    pub alive: bool,
    pub payload: Payload,
}

/// The payload an instance publishes about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    pub uuid: Option<String>,
    pub error: Option<String>,
    pub ready: bool,
}

/// `Membership`: `pairs()`, `myself()`, `subscribe()`/`unsubscribe()`,
/// `set_payload(k, v)`.
#[async_trait]
pub trait Membership: Send + Sync {
    /// All known `(uri, MemberInfo)` pairs, myself included.
    fn pairs(&self) -> Vec<(String, MemberInfo)>;

    /// This instance's own URI.
    fn myself(&self) -> String;

    /// Subscribes to membership-change events (fired on join/leave/liveness
    /// flip). Returns a receiver the failover worker wakes on.
    fn subscribe(&self) -> broadcast::Receiver<()>;

    /// Cancels a previously held subscription; a no-op for this
    /// broadcast-backed implementation beyond dropping the receiver.
    fn unsubscribe(&self) {}

    /// Publishes this instance's payload (the `{ready: true}` /
    /// `{error: ...}` contract from spec §4.E step 7).
    fn set_payload(&self, payload: Payload);
}

/// In-process simulated gossip table: a `DashMap` of `uri -> MemberInfo`
/// shared by every instance in a test, plus a broadcast channel standing in
/// for the membership-change condition variable of spec §4.H.
pub struct SharedMembership {
    table: Arc<DashMap<String, MemberInfo>>,
    my_uri: String,
    changes: broadcast::Sender<()>,
}

impl SharedMembership {
    pub fn new_cluster() -> Arc<DashMap<String, MemberInfo>> {
        Arc::new(DashMap::new())
    }

    pub fn join(
        table: Arc<DashMap<String, MemberInfo>>,
        my_uri: impl Into<String>,
        my_uuid: impl Into<String>,
    ) -> Self {
        let my_uri = my_uri.into();
        table.insert(
            my_uri.clone(),
            MemberInfo {
                uri: my_uri.clone(),
                alive: true,
                payload: Payload {
                    uuid: Some(my_uuid.into()),
                    error: None,
                    ready: false,
                },
            },
        );
        let (tx, _rx) = broadcast::channel(64);
        SharedMembership {
            table,
            my_uri,
            changes: tx,
        }
    }

    pub fn notify_change(&self) {
        let _ = self.changes.send(());
    }

    pub fn mark_alive(&self, uri: &str, alive: bool) {
        if let Some(mut e) = self.table.get_mut(uri) {
            e.alive = alive;
        }
        self.notify_change();
    }
}

#[async_trait]
impl Membership for SharedMembership {
    fn pairs(&self) -> Vec<(String, MemberInfo)> {
        self.table
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn myself(&self) -> String {
        self.my_uri.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn set_payload(&self, payload: Payload) {
        if let Some(mut e) = self.table.get_mut(&self.my_uri) {
            e.payload = payload;
        }
        self.notify_change();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_registers_self_as_alive() {
        let table = SharedMembership::new_cluster();
        let m = SharedMembership::join(table, "127.0.0.1:1", "u1");
        let pairs = m.pairs();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].1.alive);
    }

    #[test]
    fn set_payload_updates_entry() {
        let table = SharedMembership::new_cluster();
        let m = SharedMembership::join(table, "127.0.0.1:1", "u1");
        m.set_payload(Payload {
            uuid: Some("u1".into()),
            error: None,
            ready: true,
        });
        let pairs = m.pairs();
        assert!(pairs[0].1.payload.ready);
    }
}
