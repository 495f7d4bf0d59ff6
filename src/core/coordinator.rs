// src/core/coordinator.rs

//! 2PC Coordinator (spec §4.F): orchestrates clusterwide prepare/commit/
//! abort across peer endpoints for `patch_clusterwide`.

use crate::core::document::merge_patch;
use crate::core::errors::AppError;
use crate::core::rpc::{Request, Response, PREPARE_TIMEOUT};
use crate::core::state::Applier;
use crate::core::topology;
use crate::core::validator;
use serde_yaml::Mapping;
use tracing::{error, info, warn};

/// `patch_clusterwide(patch)`.
pub async fn patch_clusterwide(applier: &Applier, patch: &Mapping) -> Result<(), AppError> {
    let _guard = applier.try_lock_clusterwide()?;

    let old = applier
        .active_doc()
        .ok_or_else(|| AppError::ConfigLoad("no active configuration loaded".into()))?;
    let new = merge_patch(&old, patch)?;

    // Local topology validation, fail fast.
    let new_topology = topology::get(&new)?;
    let old_topology = topology::get(&old)?;
    let known_roles = applier.roles.get_known_roles();
    topology::validate(&new_topology, Some(&old_topology), &known_roles)?;
    validator::validate(&new, Some(&old), &applier.roles)?;

    // Participant set: present in new.topology.servers, not expelled, not
    // disabled, and already present in old.topology.servers.
    let mut participants: Vec<String> = new_topology
        .servers
        .iter()
        .filter(|(uuid, entry)| {
            !entry.is_expelled()
                && topology::not_disabled(entry)
                && old_topology.servers.contains_key(*uuid)
        })
        .filter_map(|(_, entry)| entry.uri().map(str::to_string))
        .collect();
    participants.sort();

    let new_yaml = serde_yaml::to_string(&new)
        .map_err(|e| AppError::ConfigApply(format!("serializing patched document: {e}")))?;

    // Prepare phase: sequential, 5s client timeout, stop on first failure.
    let mut prepared: Vec<String> = Vec::new();
    let mut prepare_err: Option<AppError> = None;
    for uri in &participants {
        match call_peer(applier, uri, Request::Prepare2pc { yaml: new_yaml.clone() }, Some(PREPARE_TIMEOUT)).await {
            Ok(()) => prepared.push(uri.clone()),
            Err(e) => {
                error!("prepare failed on peer '{uri}': {e}");
                prepare_err = Some(e);
                break;
            }
        }
    }

    if let Some(e) = prepare_err {
        for uri in &prepared {
            if let Err(abort_err) = call_peer(applier, uri, Request::Abort2pc, None).await {
                warn!("abort failed on peer '{uri}': {abort_err}");
            } else {
                info!("aborted prepared round on peer '{uri}'");
            }
        }
        return Err(e);
    }

    // Commit phase: continue on error, remember the first.
    let mut commit_err: Option<AppError> = None;
    for uri in &participants {
        if let Err(e) = call_peer(applier, uri, Request::Commit2pc, None).await {
            error!("commit failed on peer '{uri}': {e}");
            commit_err.get_or_insert(e);
        }
    }

    match commit_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn call_peer(
    applier: &Applier,
    uri: &str,
    req: Request,
    deadline: Option<std::time::Duration>,
) -> Result<(), AppError> {
    if uri == applier.membership.myself() {
        return call_local(applier, req).await;
    }
    let mut conn = applier.pool.connect(uri).await?;
    let resp = conn.call(req, deadline).await?;
    resp.into_unit_result()
}

/// Loopback path: if this instance's own URI is in the participant set
/// (it always is, unless it has expelled itself), serve the RPC in-process
/// rather than round-tripping through the network.
async fn call_local(applier: &Applier, req: Request) -> Result<(), AppError> {
    use crate::core::rpc::RpcHandler;
    let resp = match req {
        Request::Prepare2pc { yaml } => {
            Response::from_result(applier.prepare_2pc(yaml).await)
        }
        Request::Commit2pc => Response::from_result(applier.commit_2pc().await),
        Request::Abort2pc => Response::from_result(applier.abort_2pc().await),
        _ => unreachable!("coordinator only issues prepare/commit/abort"),
    };
    resp.into_unit_result()
}
