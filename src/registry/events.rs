//! Typed change events emitted by the registry.
//!
//! The document writer and the state-push bridge subscribe independently;
//! neither is wired into the registry itself.

use tokio::sync::broadcast;

use crate::models::cluster::ClusterId;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(ClusterId),
    Updated(ClusterId),
    Removed(ClusterId),
    /// Live state changed; the document is unaffected.
    StateChanged(ClusterId),
}

impl RegistryEvent {
    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            Self::Added(id) | Self::Updated(id) | Self::Removed(id) | Self::StateChanged(id) => id,
        }
    }

    /// Whether the persisted document may differ after this event.
    pub fn touches_document(&self) -> bool {
        !matches!(self, Self::StateChanged(_))
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RegistryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is normal.
    pub fn emit(&self, event: RegistryEvent) {
        log::trace!("registry: {event:?}");
        let _ = self.tx.send(event);
    }
}
