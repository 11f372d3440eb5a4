//! Versioned JSON document store.
//!
//! `load` reads the file (or starts from an empty document), runs the
//! migration chain and only then hands typed data to the caller. `save`
//! stamps the current schema version (never lowering a newer one) and
//! replaces the file atomically.

pub mod migrations;
pub mod watch;
pub mod writer;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::config::AppConfig;
use crate::error::{StoreError, StoreResult};
use migrations::{Migration, CLUSTER_STORE_MIGRATIONS, SCHEMA_VERSION_KEY};

/// A successfully loaded document.
#[derive(Debug)]
pub struct Loaded<T> {
    pub document: T,
    pub from_version: u32,
    /// True when the file on disk is at an older schema and was migrated.
    pub migrated: bool,
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    migrations: &'static [Migration],
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>, migrations: &'static [Migration]) -> Self {
        Self {
            path: path.into(),
            migrations,
        }
    }

    /// The cluster store at its per-installation location.
    pub fn cluster_store(config: &AppConfig) -> Self {
        Self::new(config.store_path(), CLUSTER_STORE_MIGRATIONS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_version(&self) -> u32 {
        migrations::latest_version(self.migrations)
    }

    /// Reads, migrates and parses the document. A missing file yields an
    /// empty document; anything unreadable is `CorruptDocument`.
    pub async fn load<T: DeserializeOwned>(&self) -> StoreResult<Loaded<T>> {
        let (value, on_disk) = match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                log::warn!("store: {} is empty, starting fresh", self.path.display());
                (Value::Object(Default::default()), false)
            }
            Ok(bytes) => (serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e))?, true),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("store: {} not found, starting fresh", self.path.display());
                (Value::Object(Default::default()), false)
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let current = self.current_version();
        if let Ok(version) = migrations::schema_version(&value) {
            if version > current {
                log::warn!(
                    "store: {} has schema {version}, newer than {current}; loading as-is and keeping it",
                    self.path.display()
                );
            }
        }

        let migrated = migrations::migrate(value, self.migrations).map_err(|e| self.corrupt(e))?;
        let document = serde_json::from_value(migrated.document).map_err(|e| self.corrupt(e))?;

        log::info!(
            "store: loaded {} (schema {} -> {current})",
            self.path.display(),
            migrated.from_version
        );

        Ok(Loaded {
            document,
            from_version: migrated.from_version,
            migrated: on_disk && !migrated.applied.is_empty(),
        })
    }

    /// Serializes `document` with the current schema version and writes it
    /// through a temp file + rename. A document already at a newer version
    /// keeps it, so newer tooling does not migrate its own data again.
    pub async fn save<T: Serialize>(&self, document: &T) -> StoreResult<()> {
        let mut value = serde_json::to_value(document)?;
        let version = migrations::schema_version(&value)
            .unwrap_or(0)
            .max(self.current_version());
        if let Some(obj) = value.as_object_mut() {
            obj.insert(SCHEMA_VERSION_KEY.into(), Value::from(version));
        }
        let text = serde_json::to_string_pretty(&value)?;
        write_atomic(&self.path, text.as_bytes()).await?;
        log::debug!("store: saved {}", self.path.display());
        Ok(())
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> StoreError {
        StoreError::CorruptDocument {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Writes `bytes` next to `path` and renames over it, so readers only ever
/// see the old or the new file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(bytes).await.map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{ClusterRecord, PersistedDocument, RawDocument};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_document() -> PersistedDocument {
        let mut a = ClusterRecord::with_id("a".into(), "/home/me/.kube/config", Some("dev".into()));
        a.preferences.cluster_name = Some("Dev".into());
        a.preferences.hidden_metrics.insert("cpu".into());
        a.metadata.insert("version".into(), json!("v1.30.2"));
        a.extra.insert("labels".into(), json!({ "team": "core" }));
        let mut b = ClusterRecord::with_id("b".into(), "/k/b", None);
        b.accessible_namespaces = Some(vec!["default".into()]);
        PersistedDocument::new(3, vec![a, b])
    }

    #[tokio::test]
    async fn missing_file_loads_empty_document() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("store.json"), CLUSTER_STORE_MIGRATIONS);

        let loaded: Loaded<RawDocument> = store.load().await.unwrap();
        assert!(loaded.document.clusters.is_empty());
        assert_eq!(loaded.document.schema_version, 3);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("store.json"), CLUSTER_STORE_MIGRATIONS);
        let doc = sample_document();

        store.save(&doc).await.unwrap();
        let loaded: Loaded<PersistedDocument> = store.load().await.unwrap();

        assert_eq!(loaded.document, doc);
        assert!(!loaded.migrated);
    }

    #[tokio::test]
    async fn missing_or_blank_file_is_an_empty_current_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonStore::new(&path, CLUSTER_STORE_MIGRATIONS);

        let loaded: Loaded<PersistedDocument> = store.load().await.unwrap();
        assert!(loaded.document.clusters.is_empty());
        assert!(!loaded.migrated);

        std::fs::write(&path, "  \n").unwrap();
        let loaded: Loaded<PersistedDocument> = store.load().await.unwrap();
        assert!(loaded.document.clusters.is_empty());
        assert!(!loaded.migrated);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_and_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ \"clusters\": [ oops").unwrap();
        let store = JsonStore::new(&path, CLUSTER_STORE_MIGRATIONS);

        let err = store.load::<RawDocument>().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptDocument { .. }), "{err}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ \"clusters\": [ oops");
    }

    #[tokio::test]
    async fn failed_migration_is_corrupt_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "clusters": 7 }"#).unwrap();
        let store = JsonStore::new(&path, CLUSTER_STORE_MIGRATIONS);

        let err = store.load::<RawDocument>().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptDocument { .. }));
    }

    #[tokio::test]
    async fn legacy_file_is_migrated_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{ "clusters": { "x": { "kubeConfigPath": "/k", "clusterName": "X" } } }"#,
        )
        .unwrap();
        let store = JsonStore::new(&path, CLUSTER_STORE_MIGRATIONS);

        let loaded: Loaded<PersistedDocument> = store.load().await.unwrap();
        assert!(loaded.migrated);
        assert_eq!(loaded.from_version, 0);
        let record = &loaded.document.clusters[0];
        assert_eq!(record.id.as_str(), "x");
        assert_eq!(record.preferences.cluster_name.as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("store.json")]);
    }

    #[tokio::test]
    async fn newer_schema_loads_without_migrating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{ "schemaVersion": 9, "clusters": [{ "id": "n", "kubeConfigPath": "/k", "future": true }] }"#,
        )
        .unwrap();
        let store = JsonStore::new(&path, CLUSTER_STORE_MIGRATIONS);

        let loaded: Loaded<PersistedDocument> = store.load().await.unwrap();
        assert!(!loaded.migrated);
        assert_eq!(loaded.document.clusters[0].extra["future"], true);
    }

    #[tokio::test]
    async fn saving_never_lowers_the_schema_version() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("store.json"), CLUSTER_STORE_MIGRATIONS);

        store.save(&PersistedDocument::new(9, vec![])).await.unwrap();
        let loaded: Loaded<RawDocument> = store.load().await.unwrap();
        assert_eq!(loaded.document.schema_version, 9);

        store.save(&PersistedDocument::new(0, vec![])).await.unwrap();
        let loaded: Loaded<RawDocument> = store.load().await.unwrap();
        assert_eq!(loaded.document.schema_version, 3);
    }
}
