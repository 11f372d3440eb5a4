// Persisted and live cluster shapes shared by every process.
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form metadata written by detectors: key → scalar or object.
pub type ClusterMetadata = Map<String, Value>;

pub mod metadata_key {
    pub const VERSION: &str = "version";
    pub const LAST_SEEN: &str = "lastSeen";
    pub const DISTRIBUTION: &str = "distribution";
}

/// Opaque cluster identifier, generated once and never changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Data URL of the user-chosen icon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hidden_metrics: BTreeSet<String>,
    #[serde(
        rename = "terminalCWD",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub terminal_cwd: Option<String>,
    /// Preferences this build does not model (prometheus settings, newer keys).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterPreferences {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One cluster as stored in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub kube_config_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_name: Option<String>,
    #[serde(default, skip_serializing_if = "ClusterPreferences::is_empty")]
    pub preferences: ClusterPreferences,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: ClusterMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessible_namespaces: Option<Vec<String>>,
    /// Fields written by newer tooling; kept through load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterRecord {
    /// A record with a freshly generated id.
    pub fn new(kube_config_path: impl Into<PathBuf>, context_name: Option<String>) -> Self {
        Self::with_id(ClusterId::generate(), kube_config_path, context_name)
    }

    pub fn with_id(
        id: ClusterId,
        kube_config_path: impl Into<PathBuf>,
        context_name: Option<String>,
    ) -> Self {
        Self {
            id,
            kube_config_path: kube_config_path.into(),
            context_name,
            preferences: ClusterPreferences::default(),
            metadata: ClusterMetadata::new(),
            accessible_namespaces: None,
            extra: Map::new(),
        }
    }

    /// Display name: the preference if set, else the context name, else the id.
    pub fn name(&self) -> &str {
        self.preferences
            .cluster_name
            .as_deref()
            .or(self.context_name.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

/// Live per-cluster state. Never written to the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub status: ClusterStatus,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
    /// Metadata as last detected at runtime.
    #[serde(default)]
    pub metadata: ClusterMetadata,
}

impl ClusterState {
    pub fn is_connected(&self) -> bool {
        self.status == ClusterStatus::Connected
    }
}

/// Wire shape of one entry on `cluster:states` and of each `cluster:state` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateSync {
    pub id: ClusterId,
    pub state: ClusterState,
}

/// Top-level document: `{ schemaVersion, clusters: [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument<R> {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default = "Vec::new")]
    pub clusters: Vec<R>,
    /// Top-level keys written by newer tooling.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed document as produced by the registry.
pub type PersistedDocument = StoreDocument<ClusterRecord>;

/// Migrated document whose records have not been parsed yet, so one bad
/// record cannot fail the whole load.
pub type RawDocument = StoreDocument<Value>;

impl<R> StoreDocument<R> {
    pub fn new(schema_version: u32, clusters: Vec<R>) -> Self {
        Self {
            schema_version,
            clusters,
            extra: Map::new(),
        }
    }
}

impl PersistedDocument {
    pub fn into_raw(self) -> Result<RawDocument, serde_json::Error> {
        let clusters = self
            .clusters
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawDocument {
            schema_version: self.schema_version,
            clusters,
            extra: self.extra,
        })
    }
}
