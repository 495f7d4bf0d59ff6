// src/core/topology.rs

//! The `topology` sibling module: structural parsing of the `topology` and
//! `vshard` sections and the checks dispatched by the validator.
//!
//! Spec §1 lists this as an external collaborator referenced only via its
//! contract; this crate implements it in full rather than stubbing it,
//! because the testable properties in spec.md §8 (URI collision rejection,
//! expelled-server exclusion, master failover) are unverifiable otherwise.
//! See DESIGN.md.

use crate::core::document::{Doc, section};
use crate::core::errors::AppError;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const EXPELLED: &str = "expelled";

/// One entry of `topology.servers`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEntry {
    Expelled,
    Active { uri: String, disabled: bool },
}

impl ServerEntry {
    pub fn uri(&self) -> Option<&str> {
        match self {
            ServerEntry::Active { uri, .. } => Some(uri),
            ServerEntry::Expelled => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ServerEntry::Active { disabled: true, .. })
    }

    pub fn is_expelled(&self) -> bool {
        matches!(self, ServerEntry::Expelled)
    }
}

/// `not_disabled(entry)`: true for an active, enabled server.
pub fn not_disabled(entry: &ServerEntry) -> bool {
    matches!(entry, ServerEntry::Active { disabled: false, .. })
}

#[derive(Debug, Clone)]
pub struct Replicaset {
    pub roles: BTreeSet<String>,
    /// Ordered sequence of server UUIDs; `master[0]` is the preferred master.
    pub master: Vec<String>,
    pub weight: f64,
    pub all_rw: bool,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub servers: BTreeMap<String, ServerEntry>,
    pub replicasets: BTreeMap<String, Replicaset>,
    pub failover: bool,
}

#[derive(Debug, Clone)]
pub struct Vshard {
    pub bucket_count: u64,
    pub bootstrapped: bool,
}

fn as_mapping<'a>(value: &'a Value, what: &str) -> Result<&'a serde_yaml::Mapping, AppError> {
    value
        .as_mapping()
        .ok_or_else(|| AppError::ConfigValidate(format!("{what} must be a mapping")))
}

fn get_str(map: &serde_yaml::Mapping, key: &str) -> Option<String> {
    map.get(Value::String(key.to_string()))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn get_bool(map: &serde_yaml::Mapping, key: &str, default: bool) -> bool {
    map.get(Value::String(key.to_string()))
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

/// `get(conf)`: parses `conf.topology` into a typed `Topology`.
pub fn get(doc: &Doc) -> Result<Topology, AppError> {
    let raw = section(doc, "topology")
        .ok_or_else(|| AppError::ConfigValidate("missing 'topology' section".into()))?;
    let map = as_mapping(raw, "topology")?;

    let mut servers = BTreeMap::new();
    if let Some(Value::Mapping(servers_raw)) = map.get(Value::String("servers".to_string())) {
        for (uuid, v) in servers_raw {
            let uuid = uuid
                .as_str()
                .ok_or_else(|| AppError::ConfigValidate("server UUID key must be a string".into()))?
                .to_string();
            let entry = match v {
                Value::String(s) if s == EXPELLED => ServerEntry::Expelled,
                Value::Mapping(rec) => {
                    let uri = get_str(rec, "uri").ok_or_else(|| {
                        AppError::ConfigValidate(format!("server '{uuid}' is missing 'uri'"))
                    })?;
                    let disabled = get_bool(rec, "disabled", false);
                    ServerEntry::Active { uri, disabled }
                }
                _ => {
                    return Err(AppError::ConfigValidate(format!(
                        "server '{uuid}' must be a record or the '{EXPELLED}' sentinel"
                    )));
                }
            };
            servers.insert(uuid, entry);
        }
    }

    let mut replicasets = BTreeMap::new();
    if let Some(Value::Mapping(rs_raw)) = map.get(Value::String("replicasets".to_string())) {
        for (rs_uuid, v) in rs_raw {
            let rs_uuid = rs_uuid
                .as_str()
                .ok_or_else(|| AppError::ConfigValidate("replicaset UUID key must be a string".into()))?
                .to_string();
            let rec = as_mapping(v, &format!("replicasets.{rs_uuid}"))?;
            let roles: BTreeSet<String> = match rec.get(Value::String("roles".to_string())) {
                Some(Value::Sequence(seq)) => seq
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => BTreeSet::new(),
            };
            let master: Vec<String> = match rec.get(Value::String("master".to_string())) {
                Some(Value::Sequence(seq)) => seq
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Some(Value::String(single)) => vec![single.clone()],
                _ => Vec::new(),
            };
            let weight = rec
                .get(Value::String("weight".to_string()))
                .and_then(Value::as_f64)
                .unwrap_or(1.0);
            let all_rw = get_bool(rec, "all_rw", false);
            replicasets.insert(
                rs_uuid,
                Replicaset {
                    roles,
                    master,
                    weight,
                    all_rw,
                },
            );
        }
    }

    let failover = get_bool(map, "failover", false);

    Ok(Topology {
        servers,
        replicasets,
        failover,
    })
}

/// Parses the `vshard` section.
pub fn get_vshard(doc: &Doc) -> Result<Vshard, AppError> {
    let raw = section(doc, "vshard")
        .ok_or_else(|| AppError::ConfigValidate("missing 'vshard' section".into()))?;
    let map = as_mapping(raw, "vshard")?;
    let bucket_count = map
        .get(Value::String("bucket_count".to_string()))
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            AppError::ConfigValidate("vshard.bucket_count must be a positive integer".into())
        })?;
    let bootstrapped = get_bool(map, "bootstrapped", false);
    Ok(Vshard {
        bucket_count,
        bootstrapped,
    })
}

/// `validate(new, old)`: structural checks independent of role hooks.
///
/// Checks: URIs unique among active servers, every replicaset master exists
/// and is not expelled, no UUID may disappear once it has appeared (expelled
/// servers are retained as tombstones, never removed), and every role name
/// referenced by a replicaset is a member of `known_roles`.
pub fn validate(
    new: &Topology,
    old: Option<&Topology>,
    known_roles: &[String],
) -> Result<(), AppError> {
    let mut seen_uris: BTreeSet<&str> = BTreeSet::new();
    for (uuid, entry) in &new.servers {
        if let ServerEntry::Active { uri, .. } = entry {
            if !seen_uris.insert(uri.as_str()) {
                return Err(AppError::ConfigValidate(format!(
                    "duplicate server URI '{uri}' (server '{uuid}')"
                )));
            }
        }
    }

    for (rs_uuid, rs) in &new.replicasets {
        for master_uuid in &rs.master {
            match new.servers.get(master_uuid) {
                None => {
                    return Err(AppError::ConfigValidate(format!(
                        "replicaset '{rs_uuid}' master '{master_uuid}' is not a known server"
                    )));
                }
                Some(ServerEntry::Expelled) => {
                    return Err(AppError::ConfigValidate(format!(
                        "replicaset '{rs_uuid}' master '{master_uuid}' is expelled"
                    )));
                }
                Some(ServerEntry::Active { .. }) => {}
            }
        }
        for role in &rs.roles {
            if !known_roles.iter().any(|k| k == role) {
                return Err(AppError::ConfigValidate(format!(
                    "replicaset '{rs_uuid}' references unknown role '{role}'"
                )));
            }
        }
    }

    if let Some(old) = old {
        for uuid in old.servers.keys() {
            if !new.servers.contains_key(uuid) {
                return Err(AppError::ConfigValidate(format!(
                    "server '{uuid}' may not be removed, only expelled"
                )));
            }
        }
    }

    Ok(())
}

/// `get_replication_config(topology, my_uuid)`: the ordered peer-URI list
/// for `my_uuid`'s replicaset (self excluded).
pub fn get_replication_config(topology: &Topology, my_uuid: &str) -> Vec<String> {
    let Some(rs) = my_replicaset(topology, my_uuid) else {
        return Vec::new();
    };
    let mut uris = Vec::new();
    for uuid in &rs.master {
        if uuid == my_uuid {
            continue;
        }
        if let Some(entry) = topology.servers.get(uuid) {
            if let Some(uri) = entry.uri() {
                uris.push(uri.to_string());
            }
        }
    }
    uris
}

/// Finds the replicaset this server belongs to (membership is defined by
/// appearing in a replicaset's `master` sequence).
pub fn my_replicaset<'a>(topology: &'a Topology, my_uuid: &str) -> Option<&'a Replicaset> {
    topology
        .replicasets
        .values()
        .find(|rs| rs.master.iter().any(|u| u == my_uuid))
}

pub fn my_replicaset_id(topology: &Topology, my_uuid: &str) -> Option<String> {
    topology
        .replicasets
        .iter()
        .find(|(_, rs)| rs.master.iter().any(|u| u == my_uuid))
        .map(|(id, _)| id.clone())
}

/// `get_active_masters(topology, alive)`: the currently-active master UUID
/// per replicaset, preferring the first candidate in `master` that is
/// enabled and reported alive by `alive`; falls back to the first candidate
/// if none are alive (documented fallback, avoids leaving a replicaset
/// without any master on total loss of liveness information).
pub fn get_active_masters(
    topology: &Topology,
    alive: impl Fn(&str) -> bool,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (rs_uuid, rs) in &topology.replicasets {
        let candidate = rs
            .master
            .iter()
            .find(|uuid| {
                topology
                    .servers
                    .get(*uuid)
                    .is_some_and(|e| not_disabled(e) && alive(uuid))
            })
            .or_else(|| rs.master.first());
        if let Some(uuid) = candidate {
            out.insert(rs_uuid.clone(), uuid.clone());
        }
    }
    out
}

/// `get_vshard_sharding_config(topology, vshard)`: the per-replicaset
/// sharding map handed to the storage/router services, keyed by replicaset
/// UUID.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicasetShardingEntry {
    pub master_uri: Option<String>,
    pub weight: f64,
}

pub fn get_vshard_sharding_config(
    topology: &Topology,
    active_masters: &BTreeMap<String, String>,
) -> BTreeMap<String, ReplicasetShardingEntry> {
    topology
        .replicasets
        .iter()
        .map(|(rs_uuid, rs)| {
            let master_uri = active_masters
                .get(rs_uuid)
                .and_then(|uuid| topology.servers.get(uuid))
                .and_then(ServerEntry::uri)
                .map(str::to_string);
            (
                rs_uuid.clone(),
                ReplicasetShardingEntry {
                    master_uri,
                    weight: rs.weight,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> Doc {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn rejects_duplicate_uris() {
        let d = doc(
            r#"
topology:
  servers:
    s1: {uri: "127.0.0.1:3301"}
    s2: {uri: "127.0.0.1:3301"}
  replicasets: {}
  failover: false
"#,
        );
        let t = get(&d).unwrap();
        assert!(validate(&t, None, &[]).is_err());
    }

    #[test]
    fn rejects_expelled_master() {
        let d = doc(
            r#"
topology:
  servers:
    s1: "expelled"
  replicasets:
    r1: {roles: [], master: [s1], weight: 1}
  failover: false
"#,
        );
        let t = get(&d).unwrap();
        assert!(validate(&t, None, &[]).is_err());
    }

    #[test]
    fn rejects_uuid_removal() {
        let old = doc(
            r#"
topology:
  servers:
    s1: {uri: "a:1"}
  replicasets: {}
  failover: false
"#,
        );
        let new = doc(
            r#"
topology:
  servers: {}
  replicasets: {}
  failover: false
"#,
        );
        let old_t = get(&old).unwrap();
        let new_t = get(&new).unwrap();
        assert!(validate(&new_t, Some(&old_t), &[]).is_err());
    }

    #[test]
    fn active_masters_skip_dead_and_fall_back() {
        let d = doc(
            r#"
topology:
  servers:
    s1: {uri: "a:1"}
    s2: {uri: "a:2"}
  replicasets:
    r1: {roles: [], master: [s1, s2], weight: 1}
  failover: true
"#,
        );
        let t = get(&d).unwrap();
        let masters = get_active_masters(&t, |u| u == "s2");
        assert_eq!(masters.get("r1").unwrap(), "s2");

        let masters_none_alive = get_active_masters(&t, |_| false);
        assert_eq!(masters_none_alive.get("r1").unwrap(), "s1");
    }
}
