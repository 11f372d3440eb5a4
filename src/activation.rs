//! Connecting and disconnecting clusters on the coordinator.
//!
//! Activation resolves the API server from the cluster's kubeconfig, probes
//! `/healthz`, runs the detectors and publishes the resulting live state.
//! Detected metadata is merged into the record as well, so it is persisted.
//!
//! Every activation or disconnect starts a new attempt for its cluster. An
//! activation only publishes its outcome while its attempt is still the
//! latest one, so a disconnect issued mid-probe sticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::detectors::{DetectTarget, DetectorSet};
use crate::error::{ChannelResult, RegistryError, RegistryResult};
use crate::ipc::{channels, handle_typed, MainChannel};
use crate::kubeconfig;
use crate::models::cluster::{ClusterId, ClusterState, ClusterStateSync, ClusterStatus};
use crate::registry::ClusterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Healthy,
    Slow,
    Unreachable,
}

/// HTTP client for talking to API servers. Accepts self-signed certs, which
/// most clusters use.
pub fn api_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
}

/// Pings `<server_url>/healthz`. Any answer within the client timeout counts
/// as reachable; answers slower than `slow_threshold` are `Slow`.
pub async fn check_cluster_health(
    client: &reqwest::Client,
    server_url: &str,
    slow_threshold: Duration,
) -> Reachability {
    let url = format!("{}/healthz", server_url.trim_end_matches('/'));
    let started = Instant::now();

    match client.get(&url).send().await {
        Ok(_) if started.elapsed() > slow_threshold => Reachability::Slow,
        Ok(_) => Reachability::Healthy,
        Err(e) => {
            log::debug!("activation: {url} unreachable: {e}");
            Reachability::Unreachable
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub id: ClusterId,
}

/// An activation in flight, as returned by [`Activator::begin`].
#[derive(Debug, Clone)]
pub struct Attempt {
    id: ClusterId,
    epoch: u64,
    /// The `Connecting` state published when the attempt began.
    pub state: ClusterState,
}

pub struct Activator {
    registry: Arc<ClusterRegistry>,
    detectors: DetectorSet,
    probe_timeout: Duration,
    slow_threshold: Duration,
    attempts: Mutex<HashMap<ClusterId, u64>>,
}

impl Activator {
    pub fn new(registry: Arc<ClusterRegistry>, config: &AppConfig) -> Self {
        Self {
            registry,
            detectors: DetectorSet::default(),
            probe_timeout: config.probe_timeout,
            slow_threshold: config.slow_threshold,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_detectors(mut self, detectors: DetectorSet) -> Self {
        self.detectors = detectors;
        self
    }

    fn publish(&self, id: &ClusterId, state: ClusterState) -> RegistryResult<ClusterState> {
        self.registry.set_state(id, state.clone())?;
        Ok(state)
    }

    /// Starts a new attempt for `id` and publishes `state` under it.
    fn supersede(&self, id: &ClusterId, state: ClusterState) -> RegistryResult<(u64, ClusterState)> {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = attempts.get(id).map_or(1, |e| e + 1);
        let state = self.publish(id, state)?;
        attempts.insert(id.clone(), epoch);
        Ok((epoch, state))
    }

    /// Publishes the outcome of `attempt` unless a newer attempt replaced
    /// it; then the cluster's current state is returned unchanged.
    fn finish(&self, attempt: &Attempt, state: ClusterState) -> RegistryResult<ClusterState> {
        let attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if attempts.get(&attempt.id) != Some(&attempt.epoch) {
            log::info!("activation: attempt for {} superseded, dropping its outcome", attempt.id);
            return self
                .registry
                .get_by_id(&attempt.id)
                .map(|c| c.state())
                .ok_or_else(|| RegistryError::UnknownCluster(attempt.id.clone()));
        }
        self.publish(&attempt.id, state)
    }

    fn offline(&self, attempt: &Attempt, reason: String) -> RegistryResult<ClusterState> {
        log::warn!("activation: cluster {} offline: {reason}", attempt.id);
        self.finish(
            attempt,
            ClusterState {
                status: ClusterStatus::Offline,
                failure_reason: Some(reason),
                ..attempt.state.clone()
            },
        )
    }

    /// Marks the cluster as connecting and starts a new attempt.
    pub fn begin(&self, id: &ClusterId) -> RegistryResult<Attempt> {
        let cluster = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        let (epoch, state) = self.supersede(
            id,
            ClusterState {
                status: ClusterStatus::Connecting,
                failure_reason: None,
                ..cluster.state()
            },
        )?;
        Ok(Attempt {
            id: id.clone(),
            epoch,
            state,
        })
    }

    /// Connects the cluster. Failures to reach it end in `Offline` with a
    /// reason; only an unknown id is an error.
    pub async fn activate(&self, id: &ClusterId) -> RegistryResult<ClusterState> {
        let attempt = self.begin(id)?;
        self.connect(&attempt).await
    }

    /// Runs an attempt started with [`Activator::begin`].
    pub async fn connect(&self, attempt: &Attempt) -> RegistryResult<ClusterState> {
        let id = &attempt.id;
        let cluster = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        log::info!("activation: connecting {} ({})", id, cluster.name());

        let context = cluster.context_name();
        let server = match kubeconfig::server_url(&cluster.kube_config_path(), context.as_deref()).await {
            Ok(Some(server)) => server,
            Ok(None) => return self.offline(attempt, "no API server for context".into()),
            Err(e) => return self.offline(attempt, e.to_string()),
        };

        let client = match api_client(self.probe_timeout) {
            Ok(c) => c,
            Err(e) => return self.offline(attempt, format!("http client: {e}")),
        };

        match check_cluster_health(&client, &server, self.slow_threshold).await {
            Reachability::Unreachable => {
                return self.offline(attempt, format!("{server} is unreachable"));
            }
            Reachability::Slow => log::warn!("activation: {server} is responding slowly"),
            Reachability::Healthy => {}
        }

        let metadata = self
            .detectors
            .detect(&DetectTarget {
                api_url: server.clone(),
                client,
            })
            .await;
        self.registry.merge_metadata(id, &metadata)?;

        let mut state_metadata = attempt.state.metadata.clone();
        state_metadata.extend(metadata);
        let state = ClusterState {
            status: ClusterStatus::Connected,
            api_url: Some(server),
            failure_reason: None,
            allowed_namespaces: cluster.record().accessible_namespaces.unwrap_or_default(),
            metadata: state_metadata,
        };
        let state = self.finish(attempt, state)?;
        if state.is_connected() {
            log::info!("activation: cluster {id} connected");
        }
        Ok(state)
    }

    /// Disconnects the cluster and cancels any activation still running.
    pub fn disconnect(&self, id: &ClusterId) -> RegistryResult<ClusterState> {
        let cluster = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| RegistryError::UnknownCluster(id.clone()))?;
        log::info!("activation: disconnecting {id}");
        let (_, state) = self.supersede(
            id,
            ClusterState {
                metadata: cluster.state().metadata,
                ..ClusterState::default()
            },
        )?;
        Ok(state)
    }

    /// Serves `cluster:activate` and `cluster:disconnect`. Activation is
    /// answered as soon as the cluster is marked connecting; the outcome
    /// arrives through the registry like any other state change.
    pub fn register<M: MainChannel + ?Sized>(self: Arc<Self>, main: &M) -> ChannelResult<()> {
        let activator = self.clone();
        handle_typed(main, channels::CLUSTER_ACTIVATE, move |req: ClusterRequest| {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| e.to_string())?;
            let attempt = activator.begin(&req.id).map_err(|e| e.to_string())?;
            let state = attempt.state.clone();
            let worker = activator.clone();
            runtime.spawn(async move {
                if let Err(e) = worker.connect(&attempt).await {
                    log::warn!("activation: {}: {e}", attempt.id);
                }
            });
            Ok(ClusterStateSync { id: req.id, state })
        })?;

        let activator = self;
        handle_typed(main, channels::CLUSTER_DISCONNECT, move |req: ClusterRequest| {
            let state = activator.disconnect(&req.id).map_err(|e| e.to_string())?;
            Ok(ClusterStateSync { id: req.id, state })
        })
    }
}
