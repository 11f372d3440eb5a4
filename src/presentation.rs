//! A presentation process: a read-only mirror of the registry kept current
//! from the document file, with live state from the coordinator.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bridge::{StateMirror, SyncOutcome};
use crate::config::AppConfig;
use crate::error::{ChannelError, ChannelResult, StartupResult};
use crate::ipc::{Subscription, ViewChannel};
use crate::kubeconfig::cluster_id_from_host;
use crate::registry::cluster::Cluster;
use crate::registry::{ClusterRegistry, ReconcileReport};
use crate::store::watch::DocumentWatcher;
use crate::store::JsonStore;

async fn pull_logged<V: ViewChannel + 'static>(mirror: &StateMirror<V>) {
    match mirror.pull_snapshot().await {
        Ok(SyncOutcome::Applied { applied, ignored }) => {
            log::debug!("presentation: state sync applied {applied}, ignored {ignored}");
        }
        Ok(SyncOutcome::AlreadyPending) => {}
        Err(ChannelError::Timeout(_)) => log::info!("presentation: no live state yet"),
        Err(e) => log::warn!("presentation: state sync failed: {e}"),
    }
}

fn log_reload(report: &ReconcileReport) {
    log::debug!(
        "presentation: reloaded (+{} ~{} -{}, {} skipped)",
        report.added.len(),
        report.updated.len(),
        report.removed.len(),
        report.skipped
    );
}

pub struct Presentation<V: ViewChannel + 'static> {
    registry: Arc<ClusterRegistry>,
    mirror: Arc<StateMirror<V>>,
    subscription: Subscription,
    watcher: JoinHandle<()>,
}

impl<V: ViewChannel + 'static> Presentation<V> {
    /// Loads the document, subscribes to pushes, pulls one snapshot and
    /// starts watching the file. A snapshot that does not arrive in time is
    /// not fatal.
    pub async fn attach(config: &AppConfig, view: Arc<V>) -> StartupResult<Self> {
        let store = Arc::new(JsonStore::cluster_store(config));
        let registry = Arc::new(ClusterRegistry::from_config(config));
        let watcher = DocumentWatcher::new(store, registry.clone());
        let mut changes = watcher.watch().await?;
        log_reload(&watcher.reload().await?);

        let mirror = Arc::new(StateMirror::new(registry.clone(), view, config.snapshot_timeout));
        let subscription = mirror.listen();
        pull_logged(&mirror).await;

        let settle = config.watch_settle;
        let watcher = tokio::spawn({
            let registry = registry.clone();
            let mirror = mirror.clone();
            async move {
                while changes.next(settle).await {
                    match watcher.reload().await {
                        Ok(report) => {
                            log_reload(&report);
                            for cluster in registry.finalize_removed() {
                                log::info!("presentation: cluster {} is gone", cluster.id());
                            }
                            // Pushes for these ids were dropped before they existed here.
                            if !report.added.is_empty() {
                                pull_logged(&mirror).await;
                            }
                        }
                        Err(e) => log::warn!("presentation: reload failed, keeping previous view: {e}"),
                    }
                }
                log::debug!("presentation: document watch ended");
            }
        });

        Ok(Self {
            registry,
            mirror,
            subscription,
            watcher,
        })
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Pulls a fresh snapshot from the coordinator.
    pub async fn refresh(&self) -> ChannelResult<SyncOutcome> {
        self.mirror.pull_snapshot().await
    }

    /// The cluster this process hosts, from a `<clusterId>.<host>` host.
    pub fn hosted_cluster(&self, host: &str) -> Option<Arc<Cluster>> {
        cluster_id_from_host(host).and_then(|id| self.registry.get_by_id(&id))
    }

    pub fn detach(self) {
        self.watcher.abort();
        self.subscription.unsubscribe();
        log::debug!("presentation: detached");
    }
}
