// tests/cluster_scenarios.rs

//! Cross-instance scenarios from spec §8: a small cluster of real
//! `Applier`s talking over real TCP/RPC on localhost, driven through
//! `patch_clusterwide`.

use clusterconf::core::coordinator::patch_clusterwide;
use clusterconf::core::document::{parse_patch, section};
use clusterconf::core::membership::SharedMembership;
use clusterconf::core::pool::TcpPool;
use clusterconf::core::rpc::{self, RpcHandler};
use clusterconf::Applier;
use dashmap::DashMap;
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Node {
    applier: Arc<Applier>,
    membership: Arc<SharedMembership>,
    uri: String,
    uuid: String,
    _workdir: TempDir,
}

async fn spawn_node(
    table: Arc<DashMap<String, clusterconf::core::membership::MemberInfo>>,
    uuid: &str,
) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = listener.local_addr().unwrap().to_string();
    let membership = Arc::new(SharedMembership::join(table, uri.clone(), uuid));
    let workdir = tempfile::tempdir().unwrap();
    let applier = Applier::new(
        PathBuf::from(workdir.path()),
        uuid.to_string(),
        membership.clone(),
        Arc::new(TcpPool),
    );
    let handler = applier.clone() as Arc<dyn RpcHandler>;
    tokio::spawn(async move {
        rpc::serve(listener, handler).await;
    });
    Node {
        applier,
        membership,
        uri,
        uuid: uuid.to_string(),
        _workdir: workdir,
    }
}

fn initial_doc(a: &Node, b1: &Node, b2: &Node) -> Value {
    let yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    {b2_uuid}: {{uri: "{b2_uri}"}}
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, {b2_uuid}], weight: 1, all_rw: false}}
  failover: false
vshard:
  bucket_count: 100
  bootstrapped: true
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uuid = b2.uuid,
        b2_uri = b2.uri,
    );
    serde_yaml::from_str(&yaml).unwrap()
}

async fn seed_all(nodes: &[&Node], doc: &Value) {
    for n in nodes {
        n.applier.apply(doc.clone()).await.unwrap();
    }
}

#[tokio::test]
async fn s1_successful_edit_propagates_to_every_peer() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;
    let b2 = spawn_node(table.clone(), "uuid-b2").await;

    let doc = initial_doc(&a, &b1, &b2);
    seed_all(&[&a, &b1, &b2], &doc).await;

    let patch_yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    {b2_uuid}: {{uri: "{b2_uri}"}}
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, {b2_uuid}], weight: 1, all_rw: true}}
  failover: false
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uuid = b2.uuid,
        b2_uri = b2.uri,
    );
    let patch = parse_patch(&patch_yaml).unwrap();
    patch_clusterwide(&a.applier, &patch).await.unwrap();

    for n in [&a, &b1, &b2] {
        let view = n.applier.get_readonly(None).unwrap();
        let topo = view.section("topology").unwrap();
        let rs_b = topo
            .as_mapping()
            .unwrap()
            .get(Value::String("replicasets".into()))
            .unwrap()
            .as_mapping()
            .unwrap()
            .get(Value::String("rs-b".into()))
            .unwrap();
        assert_eq!(
            rs_b.as_mapping().unwrap().get(Value::String("all_rw".into())).unwrap().as_bool(),
            Some(true),
            "peer {} did not see the committed patch",
            n.uri
        );
    }
}

#[tokio::test]
async fn s2_uri_collision_rejected_before_prepare() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;
    let b2 = spawn_node(table.clone(), "uuid-b2").await;

    let doc = initial_doc(&a, &b1, &b2);
    seed_all(&[&a, &b1, &b2], &doc).await;

    let colliding_patch_yaml = format!(
        "topology:\n  servers:\n    {b2}: {{uri: \"{b1_uri}\"}}\n",
        b2 = b2.uuid,
        b1_uri = b1.uri
    );
    let patch = parse_patch(&colliding_patch_yaml).unwrap();

    let err = patch_clusterwide(&a.applier, &patch).await.unwrap_err();
    assert!(matches!(err, clusterconf::AppError::ConfigValidate(_)));

    for n in [&a, &b1, &b2] {
        let prepare = clusterconf::core::store::prepare_path(&n.applier.workdir);
        assert!(!prepare.exists(), "peer {} has a leftover prepare file", n.uri);
    }
}

#[tokio::test]
async fn s3_expelled_server_never_contacted_and_retained() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;
    let b2 = spawn_node(table.clone(), "uuid-b2").await;

    let mut doc = initial_doc(&a, &b1, &b2);
    if let Value::Mapping(ref mut top_map) = doc {
        let topology = top_map
            .get_mut(Value::String("topology".into()))
            .unwrap()
            .as_mapping_mut()
            .unwrap();
        let servers = topology
            .get_mut(Value::String("servers".into()))
            .unwrap()
            .as_mapping_mut()
            .unwrap();
        servers.insert(Value::String("uuid-c1".into()), Value::String("expelled".into()));
    }
    seed_all(&[&a, &b1, &b2], &doc).await;

    let patch_yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    {b2_uuid}: {{uri: "{b2_uri}"}}
    uuid-c1: expelled
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, {b2_uuid}], weight: 5, all_rw: false}}
  failover: false
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uuid = b2.uuid,
        b2_uri = b2.uri,
    );
    let patch = parse_patch(&patch_yaml).unwrap();
    patch_clusterwide(&a.applier, &patch).await.unwrap();

    let view = a.applier.get_readonly(Some("topology")).unwrap();
    let servers = view.get().as_mapping().unwrap().get(Value::String("servers".into())).unwrap();
    assert_eq!(
        servers.as_mapping().unwrap().get(Value::String("uuid-c1".into())).unwrap().as_str(),
        Some("expelled")
    );
}

#[tokio::test]
async fn s4_peer_unreachable_during_prepare_aborts_cleanly() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;

    // b2's RPC server is never started, simulating "down".
    let b2_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b2_uri = b2_listener.local_addr().unwrap().to_string();
    drop(b2_listener);
    let b2_membership = Arc::new(SharedMembership::join(table.clone(), b2_uri.clone(), "uuid-b2"));
    let b2_workdir = tempfile::tempdir().unwrap();
    let b2_applier = Applier::new(
        PathBuf::from(b2_workdir.path()),
        "uuid-b2".to_string(),
        b2_membership,
        Arc::new(TcpPool),
    );

    let doc_yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    uuid-b2: {{uri: "{b2_uri}"}}
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, uuid-b2], weight: 1, all_rw: false}}
  failover: false
vshard:
  bucket_count: 100
  bootstrapped: true
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uri = b2_uri,
    );
    let doc: Value = serde_yaml::from_str(&doc_yaml).unwrap();
    a.applier.apply(doc.clone()).await.unwrap();
    b1.applier.apply(doc.clone()).await.unwrap();
    b2_applier.apply(doc.clone()).await.unwrap();

    let patch_yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    uuid-b2: {{uri: "{b2_uri}"}}
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, uuid-b2], weight: 9, all_rw: false}}
  failover: false
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uri = b2_uri,
    );
    let patch = parse_patch(&patch_yaml).unwrap();
    let err = patch_clusterwide(&a.applier, &patch).await.unwrap_err();
    assert!(matches!(err, clusterconf::AppError::ConfigFetch(_)));

    for applier in [&a.applier, &b1.applier] {
        let prepare = clusterconf::core::store::prepare_path(&applier.workdir);
        assert!(!prepare.exists());
    }
    let active_weight = section(&a.applier.active_doc().unwrap(), "topology")
        .and_then(|t| section(t, "replicasets"))
        .unwrap()
        .as_mapping()
        .unwrap()
        .get(Value::String("rs-b".into()))
        .unwrap()
        .as_mapping()
        .unwrap()
        .get(Value::String("weight".into()))
        .unwrap()
        .as_f64();
    assert_eq!(active_weight, Some(1.0), "active config must be unchanged after failed prepare");
}

#[tokio::test]
async fn s5_failover_reconfigures_on_master_down() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;
    let b2 = spawn_node(table.clone(), "uuid-b2").await;

    let doc_yaml = format!(
        r#"
topology:
  servers:
    {a_uuid}: {{uri: "{a_uri}"}}
    {b1_uuid}: {{uri: "{b1_uri}"}}
    {b2_uuid}: {{uri: "{b2_uri}"}}
  replicasets:
    rs-a: {{roles: [vshard-router], master: [{a_uuid}], weight: 1, all_rw: false}}
    rs-b: {{roles: [vshard-storage], master: [{b1_uuid}, {b2_uuid}], weight: 1, all_rw: false}}
  failover: true
vshard:
  bucket_count: 100
  bootstrapped: true
"#,
        a_uuid = a.uuid,
        a_uri = a.uri,
        b1_uuid = b1.uuid,
        b1_uri = b1.uri,
        b2_uuid = b2.uuid,
        b2_uri = b2.uri,
    );
    let doc: Value = serde_yaml::from_str(&doc_yaml).unwrap();
    seed_all(&[&a, &b1, &b2], &doc).await;

    assert!(b1.applier.is_master.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!b2.applier.is_master.load(std::sync::atomic::Ordering::SeqCst));

    // b1 (the current master) goes down. Using b2's own membership handle
    // both updates the shared table and wakes b2's failover subscription.
    b2.membership.mark_alive(&b1.uri, false);

    let mut flipped = false;
    for _ in 0..50 {
        if b2.applier.is_master.load(std::sync::atomic::Ordering::SeqCst) {
            flipped = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(flipped, "b2 never picked up mastership after b1 went down");

    let installed = b2
        .applier
        .storage_service
        .current_cfg()
        .expect("storage service should have an installed sharding config after failover");
    let rs_b = installed
        .get("rs-b")
        .expect("rs-b should be present in the reconfigured sharding map");
    assert_eq!(rs_b.master_uri.as_deref(), Some(b2.uri.as_str()));
}

#[tokio::test]
async fn s6_bootstrap_via_peer_matches_peer_config() {
    let table = SharedMembership::new_cluster();
    let a = spawn_node(table.clone(), "uuid-a").await;
    let b1 = spawn_node(table.clone(), "uuid-b1").await;
    let b2 = spawn_node(table.clone(), "uuid-b2").await;

    let doc = initial_doc(&a, &b1, &b2);
    seed_all(&[&a, &b1, &b2], &doc).await;

    // A fourth node joins with no local config.yml and no topology hint yet
    // (a fresh install); it must locate a live peer through membership and
    // fetch that peer's active config rather than waiting on disk.
    let c = spawn_node(table.clone(), "uuid-c").await;
    assert!(!clusterconf::core::store::active_path(&c.applier.workdir).exists());

    let fetched = clusterconf::core::peer_fetch::fetch_from_membership(&c.applier, None)
        .await
        .unwrap()
        .expect("a live peer should have answered with its active config");
    assert_eq!(fetched, a.applier.active_doc().unwrap());

    c.applier.apply(fetched.clone()).await.unwrap();
    let on_disk = clusterconf::core::store::load(&clusterconf::core::store::active_path(&c.applier.workdir)).unwrap();
    assert_eq!(on_disk, fetched);
}
