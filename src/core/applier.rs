// src/core/applier.rs

//! Local Applier (spec §4.E): the single-threaded apply pipeline, run by a
//! dedicated worker consuming a single-slot channel.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use crate::core::membership::Payload;
use crate::core::roles::{ApplyOpts, VSHARD_ROUTER, VSHARD_STORAGE};
use crate::core::state::{Applier, ApplyRequest};
use crate::core::topology;
use crate::core::view::ReadOnlyView;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{error, info, warn};

/// Spawns the applier worker task. It owns the receive half of the
/// single-slot channel for the lifetime of the process; if it ever
/// terminates (panicked pipeline step aside — pipeline errors are caught,
/// not propagated as panics), `apply()` starts failing fast.
pub fn spawn_worker(applier: Arc<Applier>, mut rx: Receiver<ApplyRequest>) {
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let result = run_pipeline(&applier, req.doc).await;
            let _ = req.reply.send(result);
        }
        applier.mark_worker_dead();
        warn!("applier worker channel closed; worker exiting");
    });
}

/// Runs the full apply pipeline (spec §4.E steps 1-7) against an
/// already-validated document.
pub async fn run_pipeline(applier: &Applier, doc: Doc) -> Result<(), AppError> {
    let mut first_err: Option<AppError> = None;

    // 1. Freeze and install as the active config.
    let view = ReadOnlyView::new(doc.clone());
    *applier.active.write() = Some(view);
    info!("new configuration installed as active");

    // 2. Replication: compute peer URIs and reconfigure. Non-fatal.
    let top = match topology::get(&doc) {
        Ok(t) => Some(t),
        Err(e) => {
            error!("failed to parse topology from freshly installed config: {e}");
            first_err.get_or_insert(e);
            None
        }
    };

    if let Some(top) = &top {
        let peers = topology::get_replication_config(top, &applier.my_uuid);
        if let Err(e) = reconfigure_replication(&peers).await {
            warn!("replication reconfigure failed (non-fatal): {e}");
        }

        // 3. Topology handoff + is_master.
        let alive_uris: std::collections::BTreeSet<String> = applier
            .membership
            .pairs()
            .into_iter()
            .filter(|(_, m)| m.alive)
            .map(|(uri, _)| uri)
            .collect();
        let uri_by_uuid: std::collections::BTreeMap<String, String> = top
            .servers
            .iter()
            .filter_map(|(uuid, e)| e.uri().map(|u| (uuid.clone(), u.to_string())))
            .collect();
        let alive = |uuid: &str| {
            uri_by_uuid
                .get(uuid)
                .is_some_and(|uri| alive_uris.contains(uri))
        };
        let active_masters = topology::get_active_masters(top, alive);
        let my_rs = topology::my_replicaset_id(top, &applier.my_uuid);
        let is_master = my_rs
            .as_ref()
            .and_then(|rs| active_masters.get(rs))
            .is_some_and(|m| m == &applier.my_uuid);
        applier.is_master.store(is_master, std::sync::atomic::Ordering::SeqCst);

        // 4. Built-in sharding.
        let sharding_cfg = topology::get_vshard_sharding_config(top, &active_masters);
        let vshard = topology::get_vshard(&doc).ok();
        let bucket_count = vshard.map(|v| v.bucket_count).unwrap_or(0);
        let storage_enabled = my_rs
            .as_ref()
            .and_then(|rs| top.replicasets.get(rs))
            .is_some_and(|rs| rs.roles.contains(VSHARD_STORAGE));
        let router_enabled = my_rs
            .as_ref()
            .and_then(|rs| top.replicasets.get(rs))
            .is_some_and(|rs| rs.roles.contains(VSHARD_ROUTER));

        if storage_enabled {
            if let Err(e) = applier.storage_service.cfg(sharding_cfg.clone(), bucket_count).await {
                error!("storage sharding cfg failed: {e}");
                first_err.get_or_insert(e);
            }
            applier.service_registry.insert(VSHARD_STORAGE.to_string());
        }
        if router_enabled {
            if let Err(e) = applier.router_service.cfg(sharding_cfg.clone(), bucket_count).await {
                error!("router sharding cfg failed: {e}");
                first_err.get_or_insert(e);
            }
            applier.service_registry.insert(VSHARD_ROUTER.to_string());
        }

        // 5. User roles, in registration order.
        let opts = ApplyOpts { is_master };
        let enabled_roles: std::collections::BTreeSet<String> = my_rs
            .as_ref()
            .and_then(|rs| top.replicasets.get(rs))
            .map(|rs| rs.roles.clone())
            .unwrap_or_default();

        let registry = &applier.service_registry;
        for (name, role) in applier.roles.ordered_entries() {
            let enabled = enabled_roles.contains(name.as_str());
            if enabled && !registry.contains(&name) {
                if let Err(e) = role.init(opts).await {
                    error!("role '{name}' init failed: {e}");
                    first_err.get_or_insert(AppError::ConfigApply(format!(
                        "role '{name}' init failed: {e}"
                    )));
                    continue;
                }
            }
            if enabled {
                registry.insert(name.clone());
                if let Err(e) = role.apply_config(&doc, opts).await {
                    error!("role '{name}' apply_config failed: {e}");
                    first_err.get_or_insert(AppError::ConfigApply(format!(
                        "role '{name}' apply_config failed: {e}"
                    )));
                }
            } else if registry.contains(&name) {
                if let Err(e) = role.stop(opts).await {
                    error!("role '{name}' stop failed: {e}");
                    first_err.get_or_insert(AppError::ConfigApply(format!(
                        "role '{name}' stop failed: {e}"
                    )));
                }
                registry.remove(&name);
            }
        }

        // 6. Failover worker start/stop.
        let should_run = top.failover && (storage_enabled || router_enabled);
        crate::core::failover::reconcile(applier, should_run);
    }

    // 7. Membership payload.
    match &first_err {
        Some(_) => applier.membership.set_payload(Payload {
            uuid: Some(applier.my_uuid.clone()),
            error: Some("Config apply failed".to_string()),
            ready: false,
        }),
        None => applier.membership.set_payload(Payload {
            uuid: Some(applier.my_uuid.clone()),
            error: None,
            ready: true,
        }),
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Reconfigures the underlying database runtime's replication with the
/// given ordered peer URI list. The database runtime is an external
/// collaborator (spec §1); this stub logs the intended configuration.
async fn reconfigure_replication(peers: &[String]) -> Result<(), AppError> {
    info!(peers = ?peers, "reconfiguring replication upstreams");
    Ok(())
}
