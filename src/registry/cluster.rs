use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::models::cluster::{ClusterId, ClusterMetadata, ClusterRecord, ClusterState, ClusterStateSync};

/// Live cluster: the persisted record plus runtime state.
///
/// Entities are shared as `Arc<Cluster>` and updated in place, so a reload
/// of the document never swaps out an instance someone is holding.
#[derive(Debug)]
pub struct Cluster {
    id: ClusterId,
    record: RwLock<ClusterRecord>,
    state: RwLock<ClusterState>,
}

impl Cluster {
    pub fn new(record: ClusterRecord) -> Self {
        Self {
            id: record.id.clone(),
            record: RwLock::new(record),
            state: RwLock::new(ClusterState::default()),
        }
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn record(&self) -> ClusterRecord {
        self.record.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn name(&self) -> String {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
            .to_string()
    }

    pub fn kube_config_path(&self) -> PathBuf {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .kube_config_path
            .clone()
    }

    pub fn context_name(&self) -> Option<String> {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .context_name
            .clone()
    }

    /// Replaces the persisted fields. The id never changes; a record for
    /// another id is ignored. Returns whether anything changed.
    pub fn update_record(&self, record: ClusterRecord) -> bool {
        if record.id != self.id {
            log::warn!("registry: refusing to update {} with record of {}", self.id, record.id);
            return false;
        }
        let mut current = self.record.write().unwrap_or_else(PoisonError::into_inner);
        if *current == record {
            return false;
        }
        *current = record;
        true
    }

    pub(crate) fn modify_record(&self, f: impl FnOnce(&mut ClusterRecord)) -> bool {
        let mut current = self.record.write().unwrap_or_else(PoisonError::into_inner);
        let before = current.clone();
        f(&mut *current);
        current.id = self.id.clone();
        *current != before
    }

    /// Merges detected metadata into the persisted record.
    pub fn merge_metadata(&self, metadata: &ClusterMetadata) -> bool {
        self.modify_record(|record| {
            for (key, value) in metadata {
                record.metadata.insert(key.clone(), value.clone());
            }
        })
    }

    pub fn state(&self) -> ClusterState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns whether the state changed.
    pub fn set_state(&self, state: ClusterState) -> bool {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current == state {
            return false;
        }
        *current = state;
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).is_connected()
    }

    pub fn state_sync(&self) -> ClusterStateSync {
        ClusterStateSync {
            id: self.id.clone(),
            state: self.state(),
        }
    }
}
