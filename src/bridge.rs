//! Live cluster state across the process boundary.
//!
//! Coordinator: answers `cluster:states` with a full snapshot and, whenever
//! the set of connected clusters changes, broadcasts every cluster's state on
//! `cluster:state`. Presentation: subscribes to the pushes, then pulls one
//! snapshot. Ids it does not know yet are ignored; the document reload path
//! is what introduces new clusters.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::{ChannelError, ChannelResult, RegistryError};
use crate::ipc::{broadcast_typed, channels, handle_typed, request_typed, MainChannel, Subscription, ViewChannel};
use crate::models::cluster::{ClusterId, ClusterStateSync};
use crate::registry::{ClusterRegistry, RegistryEvent};

/// One entry per registered cluster, taken at the instant of the call.
pub fn snapshot(registry: &ClusterRegistry) -> Vec<ClusterStateSync> {
    registry.list().iter().map(|c| c.state_sync()).collect()
}

fn connected_ids(registry: &ClusterRegistry) -> BTreeSet<ClusterId> {
    registry.connected().iter().map(|c| c.id().clone()).collect()
}

/// Applies one pushed state. Unknown ids are a no-op.
pub fn apply_state(registry: &ClusterRegistry, sync: ClusterStateSync) -> bool {
    match registry.set_state(&sync.id, sync.state) {
        Ok(_) => true,
        Err(RegistryError::UnknownCluster(id)) => {
            log::debug!("bridge: ignoring state for unknown cluster {id}");
            false
        }
        Err(e) => {
            log::warn!("bridge: could not apply state: {e}");
            false
        }
    }
}

// ── coordinator ───────────────────────────────────────────────────────────────

pub struct StatePushBridge<M: MainChannel + 'static> {
    registry: Arc<ClusterRegistry>,
    main: Arc<M>,
    last_connected: BTreeSet<ClusterId>,
}

impl<M: MainChannel + 'static> StatePushBridge<M> {
    /// Registers the snapshot handler. Fails if another handler already
    /// owns `cluster:states`.
    pub fn register(registry: Arc<ClusterRegistry>, main: Arc<M>) -> ChannelResult<Self> {
        let source = registry.clone();
        handle_typed(&*main, channels::CLUSTER_STATES, move |_: Value| {
            let states = snapshot(&source);
            log::debug!("bridge: answering state sync with {} cluster(s)", states.len());
            Ok(states)
        })?;
        let last_connected = connected_ids(&registry);
        Ok(Self {
            registry,
            main,
            last_connected,
        })
    }

    /// Broadcasts the state of every cluster. Returns how many were sent.
    pub fn push_state(&self) -> ChannelResult<usize> {
        let states = snapshot(&self.registry);
        for state in &states {
            broadcast_typed(&*self.main, channels::CLUSTER_STATE, state)?;
        }
        Ok(states.len())
    }

    /// Pushes everything if the connected set moved since the last
    /// successful push. A failed push is retried on the next check.
    pub fn sync_connected(&mut self) -> ChannelResult<bool> {
        let connected = connected_ids(&self.registry);
        if connected == self.last_connected {
            return Ok(false);
        }
        let sent = self.push_state()?;
        self.last_connected = connected;
        log::debug!("bridge: connected set changed, pushed {sent} state(s)");
        Ok(true)
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        let mut events = self.registry.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Updated(_)) => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = self.sync_connected() {
                    log::warn!("bridge: push failed: {e}");
                }
            }
        })
    }
}

// ── presentation ──────────────────────────────────────────────────────────────

/// Result of a snapshot pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { applied: usize, ignored: usize },
    /// Another pull from this process is still outstanding.
    AlreadyPending,
}

type PushedIds = Mutex<Option<HashSet<ClusterId>>>;

/// The single outstanding pull. Dropping it, including when the pulling
/// future is cancelled, frees the slot.
struct PullSlot<'a> {
    pushed: &'a PushedIds,
}

impl<'a> PullSlot<'a> {
    fn acquire(pushed: &'a PushedIds) -> Option<Self> {
        let mut ids = pushed.lock().unwrap_or_else(PoisonError::into_inner);
        if ids.is_some() {
            return None;
        }
        *ids = Some(HashSet::new());
        Some(Self { pushed })
    }

    /// Ids pushed since the slot was taken.
    fn release(self) -> HashSet<ClusterId> {
        self.take()
    }

    fn take(&self) -> HashSet<ClusterId> {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }
}

impl Drop for PullSlot<'_> {
    fn drop(&mut self) {
        self.take();
    }
}

pub struct StateMirror<V: ViewChannel + 'static> {
    registry: Arc<ClusterRegistry>,
    view: Arc<V>,
    timeout: Duration,
    /// Ids pushed while a pull is outstanding; `None` when no pull runs.
    pushed_during_pull: Arc<PushedIds>,
}

impl<V: ViewChannel + 'static> StateMirror<V> {
    pub fn new(registry: Arc<ClusterRegistry>, view: Arc<V>, timeout: Duration) -> Self {
        Self {
            registry,
            view,
            timeout,
            pushed_during_pull: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts applying `cluster:state` pushes to the local registry.
    pub fn listen(&self) -> Subscription {
        let registry = self.registry.clone();
        let pushed = self.pushed_during_pull.clone();
        self.view.subscribe(
            channels::CLUSTER_STATE,
            Arc::new(move |payload: Value| {
                let sync: ClusterStateSync = match serde_json::from_value(payload) {
                    Ok(sync) => sync,
                    Err(e) => {
                        log::warn!("bridge: dropping malformed state push: {e}");
                        return;
                    }
                };
                if let Some(ids) = pushed.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
                    ids.insert(sync.id.clone());
                }
                apply_state(&registry, sync);
            }),
        )
    }

    /// Pulls the coordinator's snapshot once. A push that lands while the
    /// pull is outstanding is newer than the snapshot and is kept.
    ///
    /// Gives up with [`ChannelError::Timeout`] after the configured timeout;
    /// callers treat that as "no live state yet".
    pub async fn pull_snapshot(&self) -> ChannelResult<SyncOutcome> {
        let Some(slot) = PullSlot::acquire(&self.pushed_during_pull) else {
            return Ok(SyncOutcome::AlreadyPending);
        };

        log::info!("bridge: requesting initial state sync");
        let reply = tokio::time::timeout(
            self.timeout,
            request_typed::<_, Value, Vec<ClusterStateSync>>(&*self.view, channels::CLUSTER_STATES, &Value::Null),
        )
        .await;

        let pushed = slot.release();

        let states = match reply {
            Err(_) => {
                log::warn!("bridge: state sync timed out after {:?}", self.timeout);
                return Err(ChannelError::Timeout(channels::CLUSTER_STATES.to_string()));
            }
            Ok(reply) => reply?,
        };

        let (mut applied, mut ignored) = (0, 0);
        for sync in states {
            if pushed.contains(&sync.id) {
                continue;
            }
            if apply_state(&self.registry, sync) {
                applied += 1;
            } else {
                ignored += 1;
            }
        }
        Ok(SyncOutcome::Applied { applied, ignored })
    }
}
