//! The coordinator process: owns the registry, the document file and the
//! coordinator end of every channel.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::activation::Activator;
use crate::bridge::StatePushBridge;
use crate::config::AppConfig;
use crate::error::{StartupResult, StoreError, StoreResult};
use crate::ipc::MainChannel;
use crate::registry::ClusterRegistry;
use crate::store::watch::load_into;
use crate::store::writer::DocumentWriter;
use crate::store::JsonStore;

pub struct Coordinator<M: MainChannel + 'static> {
    config: AppConfig,
    registry: Arc<ClusterRegistry>,
    store: Arc<JsonStore>,
    main: Arc<M>,
    tasks: Vec<JoinHandle<()>>,
}

impl<M: MainChannel + 'static> Coordinator<M> {
    /// Loads the document, migrating it on disk if needed, then starts the
    /// writer and the push bridge and registers the request handlers.
    ///
    /// A corrupt document stops startup; the file is left untouched.
    pub async fn start(config: AppConfig, main: Arc<M>) -> StartupResult<Self> {
        let store = Arc::new(JsonStore::cluster_store(&config));
        let registry = Arc::new(ClusterRegistry::from_config(&config));

        let (report, migrated) = load_into(&store, &registry).await?;
        log::info!(
            "coordinator: loaded {} cluster(s) from {}",
            report.added.len(),
            store.path().display()
        );
        if report.skipped > 0 {
            log::warn!("coordinator: skipped {} unreadable record(s)", report.skipped);
        }
        if migrated {
            let document = registry.to_document().map_err(StoreError::from)?;
            store.save(&document).await?;
            log::info!("coordinator: wrote migrated document");
        }

        let writer = DocumentWriter::new(store.clone(), registry.clone(), config.write_debounce)
            .with_baseline()?
            .spawn();
        let bridge = StatePushBridge::register(registry.clone(), main.clone())?.spawn();
        Arc::new(Activator::new(registry.clone(), &config)).register(&*main)?;

        Ok(Self {
            config,
            registry,
            store,
            main,
            tasks: vec![writer, bridge],
        })
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> &Arc<M> {
        &self.main
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Stops background work and writes anything the debounce had not
    /// flushed yet. Returns whether a write happened.
    pub async fn shutdown(&self) -> StoreResult<bool> {
        for task in &self.tasks {
            task.abort();
        }
        let written = DocumentWriter::new(self.store.clone(), self.registry.clone(), self.config.write_debounce)
            .with_disk_baseline()
            .await
            .flush()
            .await?;
        log::info!("coordinator: shut down");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartupError;
    use crate::ipc::local::LocalHub;
    use crate::ipc::{channels, request_typed};
    use crate::models::cluster::{ClusterRecord, ClusterStateSync, PersistedDocument};
    use crate::store::Loaded;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[tokio::test]
    async fn legacy_document_is_migrated_on_disk_at_startup() {
        let dir = tempdir().unwrap();
        let config = AppConfig::new(dir.path());
        std::fs::write(
            config.store_path(),
            json!({ "clusters": { "a": { "kubeConfigPath": "/k", "clusterName": "Alpha" } } }).to_string(),
        )
        .unwrap();

        let coordinator = Coordinator::start(config.clone(), Arc::new(LocalHub::new())).await.unwrap();
        assert_eq!(coordinator.registry().get_by_id(&"a".into()).unwrap().name(), "Alpha");

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(config.store_path()).unwrap()).unwrap();
        assert_eq!(on_disk["schemaVersion"], json!(3));
        assert_eq!(on_disk["clusters"][0]["preferences"]["clusterName"], json!("Alpha"));
    }

    #[tokio::test]
    async fn unreadable_records_survive_the_startup_migration() {
        let dir = tempdir().unwrap();
        let config = AppConfig::new(dir.path());
        std::fs::write(
            config.store_path(),
            json!({ "clusters": {
                "good": { "kubeConfigPath": "/k" },
                "odd": { "kubeConfigPath": "/k2", "preferences": { "iconOrder": 1.5 } }
            } })
            .to_string(),
        )
        .unwrap();

        let coordinator = Coordinator::start(config.clone(), Arc::new(LocalHub::new())).await.unwrap();
        assert_eq!(coordinator.registry().len(), 1);
        coordinator
            .registry()
            .add_cluster(ClusterRecord::with_id("fresh".into(), "/k3", None))
            .unwrap();
        coordinator.shutdown().await.unwrap();

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(config.store_path()).unwrap()).unwrap();
        let ids: Vec<&str> = on_disk["clusters"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["fresh", "good", "odd"]);
        assert_eq!(on_disk["clusters"][2]["preferences"]["iconOrder"], json!(1.5));
    }

    #[tokio::test]
    async fn newer_document_keeps_its_version_through_writes() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::new(dir.path());
        config.write_debounce = std::time::Duration::from_secs(60);
        std::fs::write(
            config.store_path(),
            json!({
                "schemaVersion": 9,
                "clusters": [{ "id": "a", "kubeConfigPath": "/k" }],
                "workspaces": [{ "id": "w1" }]
            })
            .to_string(),
        )
        .unwrap();

        let coordinator = Coordinator::start(config.clone(), Arc::new(LocalHub::new())).await.unwrap();
        coordinator
            .registry()
            .add_cluster(ClusterRecord::with_id("b".into(), "/k", None))
            .unwrap();
        assert!(coordinator.shutdown().await.unwrap());

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(config.store_path()).unwrap()).unwrap();
        assert_eq!(on_disk["schemaVersion"], json!(9));
        assert_eq!(on_disk["workspaces"], json!([{ "id": "w1" }]));
        assert_eq!(on_disk["clusters"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_document_stops_startup_and_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let config = AppConfig::new(dir.path());
        std::fs::write(config.store_path(), "{ broken").unwrap();

        let err = Coordinator::start(config.clone(), Arc::new(LocalHub::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Store(_)));
        assert_eq!(std::fs::read_to_string(config.store_path()).unwrap(), "{ broken");
    }

    #[tokio::test]
    async fn serves_snapshots_and_flushes_on_shutdown() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::new(dir.path());
        config.write_debounce = std::time::Duration::from_secs(60);
        let hub = Arc::new(LocalHub::new());
        let coordinator = Coordinator::start(config.clone(), hub.clone()).await.unwrap();

        coordinator
            .registry()
            .add_cluster(ClusterRecord::with_id("a".into(), "/k", None))
            .unwrap();

        let view = hub.attach();
        let states: Vec<ClusterStateSync> = request_typed(&view, channels::CLUSTER_STATES, &Value::Null)
            .await
            .unwrap();
        assert_eq!(states.len(), 1);

        assert!(!config.store_path().exists());
        assert!(coordinator.shutdown().await.unwrap());
        let loaded: Loaded<PersistedDocument> = JsonStore::cluster_store(&config).load().await.unwrap();
        assert_eq!(loaded.document.clusters.len(), 1);
    }
}
