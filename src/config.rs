use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::cluster::ClusterId;

/// Overrides the per-installation data directory.
pub const DATA_DIR_ENV: &str = "CLUSTER_REGISTRY_DATA_DIR";

const APP_DIR_NAME: &str = "cluster-registry";
const STORE_FILE_NAME: &str = "cluster-store.json";
const KUBECONFIG_DIR_NAME: &str = "kubeconfigs";

/// Paths and timing knobs shared by the coordinator and presentation processes.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Quiet period after the last registry mutation before the document is written.
    pub write_debounce: Duration,
    /// How long a presentation process waits for the initial state snapshot.
    pub snapshot_timeout: Duration,
    /// Quiet period after a document change before a presentation process reloads.
    pub watch_settle: Duration,
    /// Reachability probe timeout; anything slower counts as unreachable.
    pub probe_timeout: Duration,
    /// Probe responses slower than this are reported as slow.
    pub slow_threshold: Duration,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_debounce: Duration::from_millis(500),
            snapshot_timeout: Duration::from_secs(5),
            watch_settle: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_millis(1500),
        }
    }

    /// Resolves the data directory from `CLUSTER_REGISTRY_DATA_DIR`, then the
    /// platform config dir. Returns `None` when neither is available.
    pub fn from_env() -> Option<Self> {
        std::env::var(DATA_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| PathBuf::from(v.trim()))
            .or_else(|| dirs::config_dir().map(|d| d.join(APP_DIR_NAME)))
            .map(Self::new)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE_NAME)
    }

    pub fn stored_kubeconfig_folder(&self) -> PathBuf {
        self.data_dir.join(KUBECONFIG_DIR_NAME)
    }

    pub fn custom_kubeconfig_path(&self, id: &ClusterId) -> PathBuf {
        custom_kubeconfig_path(&self.stored_kubeconfig_folder(), id)
    }
}

/// `<folder>/<id>`, no extension.
pub fn custom_kubeconfig_path(folder: &Path, id: &ClusterId) -> PathBuf {
    folder.join(id.as_str())
}
