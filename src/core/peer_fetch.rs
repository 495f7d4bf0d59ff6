// src/core/peer_fetch.rs

//! Peer Fetcher (spec §4.G): used only at boot, locates a suitable peer via
//! membership and pulls its active config.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use crate::core::rpc::{Request, Response};
use crate::core::state::Applier;
use crate::core::topology::Topology;
use rand::seq::SliceRandom;
use tracing::info;

/// `fetch_from_membership(topology_hint)`.
///
/// Returns `Ok(None)` when the caller should retry (no live candidate yet,
/// or disk should be used instead — callers fall back to `store::load` in
/// that case).
pub async fn fetch_from_membership(
    applier: &Applier,
    topology_hint: Option<&Topology>,
) -> Result<Option<Doc>, AppError> {
    if let Some(hint) = topology_hint {
        let my_entry = hint.servers.get(&applier.my_uuid);
        let only_one_server = hint.servers.len() == 1;
        if my_entry.is_none() || my_entry.is_some_and(|e| e.is_expelled()) || only_one_server {
            return Ok(None);
        }
    }

    let hint_uris: Option<std::collections::BTreeSet<String>> = topology_hint.map(|t| {
        t.servers
            .values()
            .filter_map(|e| e.uri())
            .map(str::to_string)
            .collect()
    });

    let myself = applier.membership.myself();
    let candidates: Vec<String> = applier
        .membership
        .pairs()
        .into_iter()
        .filter(|(uri, info)| {
            info.alive
                && info.payload.uuid.is_some()
                && info.payload.error.is_none()
                && uri != &myself
                && hint_uris.as_ref().is_none_or(|hints| hints.contains(uri))
        })
        .map(|(uri, _)| uri)
        .collect();

    let Some(chosen) = candidates.choose(&mut rand::thread_rng()) else {
        return Ok(None);
    };

    info!("fetching active configuration from peer '{chosen}'");
    let mut conn = applier.pool.connect(chosen).await?;
    match conn.call(Request::LoadFromFile, None).await? {
        Response::OkDoc { yaml } => {
            let doc: Doc = serde_yaml::from_str(&yaml)
                .map_err(|e| AppError::ConfigFetch(format!("parsing peer document: {e}")))?;
            Ok(Some(doc))
        }
        Response::Err { message } => Err(AppError::ConfigFetch(message)),
        Response::Ok => Err(AppError::ConfigFetch(
            "peer returned an unexpected empty response".into(),
        )),
    }
}
