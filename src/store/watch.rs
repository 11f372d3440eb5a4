//! Keeps a presentation-side registry mirror in step with the document file.
//!
//! Only the coordinator writes the file. Mirrors watch its directory with
//! `notify` and reconcile once a change has settled.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::error::{StoreError, StoreResult};
use crate::models::cluster::RawDocument;
use crate::registry::{ClusterRegistry, ReconcileReport};
use crate::store::{JsonStore, Loaded};

/// Loads the document and reconciles it into `registry`. On error the
/// registry is left exactly as it was.
pub async fn load_into(store: &JsonStore, registry: &ClusterRegistry) -> StoreResult<(ReconcileReport, bool)> {
    let Loaded {
        document, migrated, ..
    } = store.load::<RawDocument>().await?;
    Ok((registry.reconcile(&document), migrated))
}

pub struct DocumentWatcher {
    store: Arc<JsonStore>,
    registry: Arc<ClusterRegistry>,
}

impl DocumentWatcher {
    pub fn new(store: Arc<JsonStore>, registry: Arc<ClusterRegistry>) -> Self {
        Self { store, registry }
    }

    /// Reads the file and reconciles it into the registry.
    pub async fn reload(&self) -> StoreResult<ReconcileReport> {
        let (report, _) = load_into(&self.store, &self.registry).await?;
        Ok(report)
    }

    /// Starts watching the directory that holds the document. Events for
    /// other files in it are dropped.
    pub async fn watch(&self) -> StoreResult<DocumentChanges> {
        let dir = self
            .store
            .path()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let file_name = self.store.path().file_name().map(OsStr::to_os_string);
        let (tx, events) = unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, file_name.as_ref()) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => log::warn!("store: watch error: {e}"),
        })
        .map_err(|source| StoreError::Watch {
            path: dir.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| StoreError::Watch {
                path: dir.clone(),
                source,
            })?;
        log::debug!("store: watching {}", dir.display());

        Ok(DocumentChanges {
            _watcher: watcher,
            events,
        })
    }
}

fn touches(event: &Event, file_name: Option<&OsString>) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == file_name.map(OsString::as_os_str))
}

/// Change notifications for one document. Watching stops on drop.
pub struct DocumentChanges {
    _watcher: RecommendedWatcher,
    events: UnboundedReceiver<()>,
}

impl DocumentChanges {
    /// Waits for the document to change, then for `settle` so the events of
    /// one write are reported once. Returns `false` when the watcher is gone.
    pub async fn next(&mut self, settle: Duration) -> bool {
        if self.events.recv().await.is_none() {
            return false;
        }
        tokio::time::sleep(settle).await;
        while self.events.try_recv().is_ok() {}
        true
    }
}
