// src/core/failover.rs

//! Failover Worker (spec §4.H): wakes on membership events, reconfigures
//! sharding, and re-invokes role apply hooks. Cancellable; cancellation
//! unsubscribes from membership.

use crate::core::roles::ApplyOpts;
use crate::core::state::{Applier, FailoverHandle};
use crate::core::topology;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Starts or stops the failover worker so its running state matches
/// `should_run` (spec §4.E step 6). A no-op if already in the right state.
pub fn reconcile(applier: &Applier, should_run: bool) {
    let mut guard = applier.failover.lock();
    let running = guard.is_some();
    if should_run == running {
        return;
    }
    if should_run {
        let cancel = CancellationToken::new();
        let rx = applier.membership.subscribe();
        let task_applier = applier.arc();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            run(task_applier, rx, task_cancel).await;
        });
        *guard = Some(FailoverHandle { cancel, join });
        info!("failover worker started");
    } else if let Some(handle) = guard.take() {
        handle.cancel.cancel();
        applier.membership.unsubscribe();
        info!("failover worker stopped");
    }
}

/// The worker loop: `idle -> (event) -> running -> (done) -> idle`, any
/// state `-> (cancel) -> stopped`.
async fn run(
    applier: Arc<Applier>,
    mut events: tokio::sync::broadcast::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            recv = events.recv() => {
                match recv {
                    Ok(()) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
                if let Err(e) = step(&applier).await {
                    warn!("failover iteration failed: {e}");
                }
            }
        }
    }
}

async fn step(applier: &Applier) -> Result<(), crate::core::errors::AppError> {
    let doc = applier
        .active_doc()
        .ok_or_else(|| crate::core::errors::AppError::Failover("no active configuration".into()))?;
    let top = topology::get(&doc)?;

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
    let active_masters = topology::get_active_masters(&top, alive);
    let my_rs = topology::my_replicaset_id(&top, &applier.my_uuid);
    let is_master = my_rs
        .as_ref()
        .and_then(|rs| active_masters.get(rs))
        .is_some_and(|m| m == &applier.my_uuid);
    applier
        .is_master
        .store(is_master, std::sync::atomic::Ordering::SeqCst);

    let new_cfg = topology::get_vshard_sharding_config(&top, &active_masters);
    let vshard = topology::get_vshard(&doc).ok();
    let bucket_count = vshard.map(|v| v.bucket_count).unwrap_or(0);

    use crate::core::roles::{VSHARD_ROUTER, VSHARD_STORAGE};
    let installed = [
        (VSHARD_STORAGE, &applier.storage_service),
        (VSHARD_ROUTER, &applier.router_service),
    ];
    for (name, service) in installed {
        if !applier.service_registry.contains(name) {
            continue;
        }
        if service.current_cfg().as_ref() != Some(&new_cfg) {
            if let Err(e) = service.cfg(new_cfg.clone(), bucket_count).await {
                error!("failover reconfigure failed: {e}");
            }
        }
    }

    let opts = ApplyOpts { is_master };
    for (name, role) in applier.roles.ordered_entries() {
        if !applier.service_registry.contains(&name) {
            continue;
        }
        if let Err(e) = role.validate_config(&doc, Some(&doc)) {
            warn!("role '{name}' revalidation failed during failover: {e}");
            continue;
        }
        if let Err(e) = role.apply_config(&doc, opts).await {
            warn!("role '{name}' re-apply failed during failover: {e}");
        }
    }

    Ok(())
}
