//! Debounced persistence of the registry.
//!
//! The writer listens to registry events; after the last document-affecting
//! event of a burst has been quiet for the debounce period it serializes the
//! registry and writes it, but only if the result differs structurally from
//! what was last written.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::error::StoreResult;
use crate::models::cluster::RawDocument;
use crate::registry::{ClusterRegistry, RegistryEvent};
use crate::store::JsonStore;

pub struct DocumentWriter {
    store: Arc<JsonStore>,
    registry: Arc<ClusterRegistry>,
    debounce: Duration,
    last_written: Option<Value>,
}

impl DocumentWriter {
    pub fn new(store: Arc<JsonStore>, registry: Arc<ClusterRegistry>, debounce: Duration) -> Self {
        Self {
            store,
            registry,
            debounce,
            last_written: None,
        }
    }

    /// Treats the registry's current content as already on disk.
    pub fn with_baseline(mut self) -> StoreResult<Self> {
        self.last_written = Some(serde_json::to_value(self.registry.to_document()?)?);
        Ok(self)
    }

    /// Treats whatever is on disk now as the last write. An unreadable file
    /// leaves no baseline, so the next flush writes.
    pub async fn with_disk_baseline(mut self) -> Self {
        match self.store.load::<RawDocument>().await {
            Ok(loaded) => self.last_written = serde_json::to_value(loaded.document).ok(),
            Err(e) => log::debug!("store: no usable baseline on disk: {e}"),
        }
        self
    }

    /// Writes the registry if it differs from the last write. Returns
    /// whether a write happened.
    pub async fn flush(&mut self) -> StoreResult<bool> {
        let value = serde_json::to_value(self.registry.to_document()?)?;
        if self.last_written.as_ref() == Some(&value) {
            log::trace!("store: document unchanged, skipping write");
            return Ok(false);
        }
        self.store.save(&value).await?;
        self.last_written = Some(value);
        Ok(true)
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            log::error!("store: failed to write {}: {e}", self.store.path().display());
        }
    }

    /// Subscribes before spawning so no event between the two is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.registry.events().subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: Receiver<RegistryEvent>) {
        loop {
            match events.recv().await {
                Ok(event) if event.touches_document() => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("store: writer lagged by {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }

            let mut deadline = Instant::now() + self.debounce;
            loop {
                match timeout_at(deadline, events.recv()).await {
                    Err(_) => break,
                    Ok(Ok(event)) if event.touches_document() => {
                        deadline = Instant::now() + self.debounce;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(RecvError::Lagged(_))) => {
                        deadline = Instant::now() + self.debounce;
                    }
                    Ok(Err(RecvError::Closed)) => {
                        self.flush_logged().await;
                        return;
                    }
                }
            }

            self.flush_logged().await;
        }
        log::debug!("store: writer stopped");
    }
}
