use std::sync::Arc;
use std::time::Duration;

use cluster_registry_lib::config::AppConfig;
use cluster_registry_lib::coordinator::Coordinator;
use cluster_registry_lib::ipc::local::LocalHub;
use cluster_registry_lib::ipc::{channels, MainChannel};
use cluster_registry_lib::models::cluster::{ClusterId, ClusterRecord, ClusterState, ClusterStatus, PersistedDocument};
use cluster_registry_lib::presentation::Presentation;
use cluster_registry_lib::registry::ClusterRegistry;
use cluster_registry_lib::store::JsonStore;
use serde_json::json;
use tempfile::tempdir;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn status(registry: &ClusterRegistry, id: &str) -> Option<ClusterStatus> {
    registry.get_by_id(&ClusterId::from(id)).map(|c| c.state().status)
}

fn connected() -> ClusterState {
    ClusterState {
        status: ClusterStatus::Connected,
        ..Default::default()
    }
}

#[tokio::test]
async fn presentation_follows_coordinator_through_connects_and_removals() {
    let dir = tempdir().unwrap();
    let mut config = AppConfig::new(dir.path());
    config.write_debounce = Duration::from_millis(20);
    config.watch_settle = Duration::from_millis(20);
    config.snapshot_timeout = Duration::from_secs(2);

    JsonStore::cluster_store(&config)
        .save(&PersistedDocument::new(
            3,
            vec![
                ClusterRecord::with_id("A".into(), "/kube/a", Some("a".into())),
                ClusterRecord::with_id("B".into(), "/kube/b", Some("b".into())),
            ],
        ))
        .await
        .unwrap();

    let hub = Arc::new(LocalHub::new());
    let coordinator = Coordinator::start(config.clone(), hub.clone()).await.unwrap();
    let main = coordinator.registry().clone();
    main.set_state(&"A".into(), connected()).unwrap();

    // Late attach: the snapshot carries A connected, B disconnected.
    let presentation = Presentation::attach(&config, Arc::new(hub.attach())).await.unwrap();
    let mirror = presentation.registry().clone();
    assert_eq!(status(&mirror, "A"), Some(ClusterStatus::Connected));
    assert_eq!(status(&mirror, "B"), Some(ClusterStatus::Disconnected));

    // B connects: the connected set changes and everything is pushed.
    main.set_state(&"B".into(), connected()).unwrap();
    eventually("B to connect in the mirror", || {
        status(&mirror, "B") == Some(ClusterStatus::Connected)
    })
    .await;
    assert_eq!(status(&mirror, "A"), Some(ClusterStatus::Connected));

    // A is removed; the mirror learns it from the rewritten document.
    main.remove_by_id(&"A".into()).await.unwrap();
    eventually("A to leave the mirror", || mirror.get_by_id(&"A".into()).is_none()).await;
    assert_eq!(mirror.len(), 1);

    // A stray push about A is ignored.
    hub.broadcast(
        channels::CLUSTER_STATE,
        json!({ "id": "A", "state": { "status": "connected" } }),
    )
    .unwrap();
    assert!(mirror.get_by_id(&"A".into()).is_none());
    assert_eq!(status(&mirror, "B"), Some(ClusterStatus::Connected));

    presentation.detach();
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn cluster_added_after_attach_gets_state_on_next_reload() {
    let dir = tempdir().unwrap();
    let mut config = AppConfig::new(dir.path());
    config.write_debounce = Duration::from_millis(20);
    config.watch_settle = Duration::from_millis(20);

    let hub = Arc::new(LocalHub::new());
    let coordinator = Coordinator::start(config.clone(), hub.clone()).await.unwrap();
    let presentation = Presentation::attach(&config, Arc::new(hub.attach())).await.unwrap();
    let mirror = presentation.registry().clone();
    assert!(mirror.is_empty());

    // The push for C races ahead of the document write and is dropped.
    let main = coordinator.registry().clone();
    main.add_cluster(ClusterRecord::with_id("C".into(), "/kube/c", None)).unwrap();
    main.set_state(&"C".into(), connected()).unwrap();

    eventually("C to connect in the mirror", || {
        status(&mirror, "C") == Some(ClusterStatus::Connected)
    })
    .await;

    presentation.detach();
    coordinator.shutdown().await.unwrap();
}
