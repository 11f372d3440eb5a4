//! Authoritative map of cluster id → live [`Cluster`].
//!
//! One registry exists per process. The coordinator mutates it; presentation
//! processes only reconcile it from the shared document and apply pushed
//! state. Readers always see a whole map: writers build the next map aside
//! and swap it in under the lock.

pub mod cluster;
pub mod events;

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use crate::config::{self, AppConfig};
use crate::error::{RegistryError, RegistryResult};
use crate::models::cluster::{
    ClusterId, ClusterMetadata, ClusterRecord, ClusterState, PersistedDocument, RawDocument,
};
use crate::store::migrations::{latest_version, CLUSTER_STORE_MIGRATIONS};

pub use cluster::Cluster;
pub use events::{EventBus, RegistryEvent};

type ClusterMap = BTreeMap<ClusterId, Arc<Cluster>>;

/// What a reconcile pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<ClusterId>,
    pub updated: Vec<ClusterId>,
    pub removed: Vec<ClusterId>,
    /// Records that could not be parsed or repeated an id.
    pub skipped: usize,
}

/// Parts of the last reconciled document the registry has no entity for.
/// They go back out unchanged with every write.
#[derive(Debug, Default)]
struct Carried {
    unparsed: Vec<Value>,
    schema_version: u32,
    extra: Map<String, Value>,
}

#[derive(Debug)]
pub struct ClusterRegistry {
    clusters: RwLock<Arc<ClusterMap>>,
    removed: RwLock<ClusterMap>,
    carried: RwLock<Carried>,
    kubeconfig_dir: PathBuf,
    events: EventBus,
}

impl ClusterRegistry {
    pub fn new(kubeconfig_dir: impl Into<PathBuf>) -> Self {
        Self {
            clusters: RwLock::new(Arc::new(ClusterMap::new())),
            removed: RwLock::new(ClusterMap::new()),
            carried: RwLock::new(Carried::default()),
            kubeconfig_dir: kubeconfig_dir.into(),
            events: EventBus::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.stored_kubeconfig_folder())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stored_kubeconfig_folder(&self) -> &Path {
        &self.kubeconfig_dir
    }

    pub fn custom_kubeconfig_path(&self, id: &ClusterId) -> PathBuf {
        config::custom_kubeconfig_path(&self.kubeconfig_dir, id)
    }

    /// Whether the cluster's kubeconfig lives in the store-managed folder,
    /// i.e. it was pasted in and is deleted together with the cluster.
    pub fn owns_kubeconfig(&self, cluster: &Cluster) -> bool {
        cluster.kube_config_path() == self.custom_kubeconfig_path(cluster.id())
    }

    fn snapshot(&self) -> Arc<ClusterMap> {
        self.clusters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_by_id(&self, id: &ClusterId) -> Option<Arc<Cluster>> {
        self.snapshot().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Cluster>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn connected(&self) -> Vec<Arc<Cluster>> {
        self.snapshot()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    pub fn has_any(&self) -> bool {
        !self.snapshot().is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_any()
    }

    /// Entities dropped by the last reconcile, kept until finalized.
    pub fn removed_clusters(&self) -> Vec<Arc<Cluster>> {
        self.removed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drains the removed set once callers have reacted to the removals.
    pub fn finalize_removed(&self) -> Vec<Arc<Cluster>> {
        let mut removed = self.removed.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *removed).into_values().collect()
    }

    pub fn add_cluster(&self, record: ClusterRecord) -> RegistryResult<Arc<Cluster>> {
        self.add_entity(Arc::new(Cluster::new(record)))
    }

    /// Inserts an already constructed entity. Ids must be new.
    pub fn add_entity(&self, cluster: Arc<Cluster>) -> RegistryResult<Arc<Cluster>> {
        validate_id(cluster.id())?;
        {
            let mut guard = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
            if guard.contains_key(cluster.id()) {
                return Err(RegistryError::DuplicateIdentifier(cluster.id().clone()));
            }
            let mut next = ClusterMap::clone(&guard);
            next.insert(cluster.id().clone(), cluster.clone());
            *guard = Arc::new(next);
        }
        log::info!("registry: added cluster {} ({})", cluster.id(), cluster.name());
        self.events.emit(RegistryEvent::Added(cluster.id().clone()));
        Ok(cluster)
    }

    /// Adds every record or none of them.
    pub fn add_clusters(&self, records: Vec<ClusterRecord>) -> RegistryResult<Vec<Arc<Cluster>>> {
        let clusters: Vec<Arc<Cluster>> = records.into_iter().map(|r| Arc::new(Cluster::new(r))).collect();
        {
            let mut guard = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = ClusterMap::clone(&guard);
            for cluster in &clusters {
                validate_id(cluster.id())?;
                if next.insert(cluster.id().clone(), cluster.clone()).is_some() {
                    return Err(RegistryError::DuplicateIdentifier(cluster.id().clone()));
                }
            }
            *guard = Arc::new(next);
        }
        for cluster in &clusters {
            log::info!("registry: added cluster {} ({})", cluster.id(), cluster.name());
            self.events.emit(RegistryEvent::Added(cluster.id().clone()));
        }
        Ok(clusters)
    }

    /// Removes a cluster and, when the registry owns its kubeconfig, the file
    /// too. A file that is already gone is not an error.
    pub async fn remove_by_id(&self, id: &ClusterId) -> Option<Arc<Cluster>> {
        let cluster = {
            let mut guard = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
            if !guard.contains_key(id) {
                return None;
            }
            let mut next = ClusterMap::clone(&guard);
            let cluster = next.remove(id);
            *guard = Arc::new(next);
            cluster
        }?;

        log::info!("registry: removed cluster {id}");
        self.events.emit(RegistryEvent::Removed(id.clone()));

        if self.owns_kubeconfig(&cluster) {
            let path = cluster.kube_config_path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::info!("registry: deleted {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    log::debug!("registry: {} already gone", path.display())
                }
                Err(e) => log::warn!("registry: could not delete {}: {e}", path.display()),
            }
        }
        Some(cluster)
    }

    pub async fn remove_cluster(&self, record: &ClusterRecord) -> Option<Arc<Cluster>> {
        self.remove_by_id(&record.id).await
    }

    /// Merges a freshly loaded document into the live map.
    ///
    /// Known ids keep their entity (and its live state) and get the new
    /// record; unknown ids get a new entity; ids missing from the document
    /// move to the removed set. Bad records are skipped one by one and kept
    /// verbatim for the next write; repeated ids are dropped.
    pub fn reconcile(&self, document: &RawDocument) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut records = Vec::with_capacity(document.clusters.len());
        let mut unparsed = Vec::new();
        let mut seen = BTreeSet::new();

        for raw in &document.clusters {
            match parse_record(raw) {
                Ok(record) if seen.insert(record.id.clone()) => records.push(record),
                Ok(record) => {
                    log::warn!("registry: skipping duplicate record for {}", record.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    log::warn!("registry: skipping record: {e}");
                    unparsed.push(raw.clone());
                    report.skipped += 1;
                }
            }
        }
        *self.carried.write().unwrap_or_else(PoisonError::into_inner) = Carried {
            unparsed,
            schema_version: document.schema_version,
            extra: document.extra.clone(),
        };

        let mut removed = ClusterMap::new();
        {
            let mut guard = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = ClusterMap::new();
            for record in records {
                let id = record.id.clone();
                let cluster = match guard.get(&id) {
                    Some(existing) => {
                        if existing.update_record(record) {
                            report.updated.push(id.clone());
                        }
                        existing.clone()
                    }
                    None => {
                        report.added.push(id.clone());
                        Arc::new(Cluster::new(record))
                    }
                };
                next.insert(id, cluster);
            }
            for (id, cluster) in guard.iter() {
                if !next.contains_key(id) {
                    report.removed.push(id.clone());
                    removed.insert(id.clone(), cluster.clone());
                }
            }
            *guard = Arc::new(next);
        }
        *self.removed.write().unwrap_or_else(PoisonError::into_inner) = removed;

        for id in &report.added {
            self.events.emit(RegistryEvent::Added(id.clone()));
        }
        for id in &report.updated {
            self.events.emit(RegistryEvent::Updated(id.clone()));
        }
        for id in &report.removed {
            self.events.emit(RegistryEvent::Removed(id.clone()));
        }

        log::debug!(
            "registry: reconciled {} added, {} updated, {} removed, {} skipped",
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.skipped
        );
        report
    }

    /// Persisted view of every live cluster; live state is left out.
    ///
    /// Records the last reconcile could not parse follow the live ones, and
    /// a document from a newer schema keeps its version and top-level keys.
    pub fn to_document(&self) -> serde_json::Result<RawDocument> {
        let carried = self.carried.read().unwrap_or_else(PoisonError::into_inner);
        let records = self.snapshot().values().map(|c| c.record()).collect();
        let version = latest_version(CLUSTER_STORE_MIGRATIONS).max(carried.schema_version);
        let mut document = PersistedDocument::new(version, records).into_raw()?;
        document.clusters.extend(carried.unparsed.iter().cloned());
        document.extra = carried.extra.clone();
        Ok(document)
    }

    /// Applies `f` to a cluster's record and announces the change.
    pub fn update_record(
        &self,
        id: &ClusterId,
        f: impl FnOnce(&mut ClusterRecord),
    ) -> RegistryResult<bool> {
        let cluster = self
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        let changed = cluster.modify_record(f);
        if changed {
            self.events.emit(RegistryEvent::Updated(id.clone()));
        }
        Ok(changed)
    }

    pub fn merge_metadata(&self, id: &ClusterId, metadata: &ClusterMetadata) -> RegistryResult<bool> {
        let cluster = self
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        let changed = cluster.merge_metadata(metadata);
        if changed {
            self.events.emit(RegistryEvent::Updated(id.clone()));
        }
        Ok(changed)
    }

    pub fn set_state(&self, id: &ClusterId, state: ClusterState) -> RegistryResult<bool> {
        let cluster = self
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        let changed = cluster.set_state(state);
        if changed {
            self.events.emit(RegistryEvent::StateChanged(id.clone()));
        }
        Ok(changed)
    }
}

fn validate_id(id: &ClusterId) -> RegistryResult<()> {
    if id.as_str().trim().is_empty() {
        return Err(RegistryError::InvalidRecord {
            id: id.to_string(),
            reason: "empty id".into(),
        });
    }
    Ok(())
}

fn parse_record(raw: &serde_json::Value) -> RegistryResult<ClusterRecord> {
    let id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("<missing>")
        .to_string();
    let record: ClusterRecord =
        serde_json::from_value(raw.clone()).map_err(|e| RegistryError::InvalidRecord {
            id: id.clone(),
            reason: e.to_string(),
        })?;
    validate_id(&record.id)?;
    if record.kube_config_path.as_os_str().is_empty() {
        return Err(RegistryError::InvalidRecord {
            id,
            reason: "empty kubeConfigPath".into(),
        });
    }
    Ok(record)
}
