//! Kubeconfig inspection and pasted-config import.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::config::Kubeconfig;

use crate::error::{RegistryError, RegistryResult};
use crate::models::cluster::{ClusterId, ClusterRecord};
use crate::models::k8s::KubeContext;
use crate::registry::cluster::Cluster;
use crate::registry::ClusterRegistry;
use crate::store::write_atomic;

// ── helpers ───────────────────────────────────────────────────────────────────

fn invalid(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Kubeconfig(e.to_string())
}

/// Summarises every context of `kubeconfig`. Contexts without a body are
/// skipped.
pub fn summarize(kubeconfig: &Kubeconfig, source: Option<&Path>) -> Vec<KubeContext> {
    let current = kubeconfig.current_context.clone().unwrap_or_default();

    // cluster name → API server URL
    let cluster_servers: HashMap<&str, &str> = kubeconfig
        .clusters
        .iter()
        .filter_map(|nc| {
            let server = nc.cluster.as_ref()?.server.as_deref()?;
            Some((nc.name.as_str(), server))
        })
        .collect();

    kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let ctx = named.context.as_ref()?;
            Some(KubeContext {
                name: named.name.clone(),
                cluster: ctx.cluster.clone(),
                user: ctx.user.clone().unwrap_or_default(),
                namespace: ctx.namespace.clone(),
                is_active: named.name == current,
                server_url: cluster_servers.get(ctx.cluster.as_str()).map(|s| s.to_string()),
                source_file: source.map(|p| p.display().to_string()),
            })
        })
        .collect()
}

async fn read(path: &Path) -> RegistryResult<Kubeconfig> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
    Kubeconfig::from_yaml(&text).map_err(|e| invalid(format!("{}: {e}", path.display())))
}

/// Lists the contexts of the kubeconfig file at `path`.
pub async fn list_contexts(path: &Path) -> RegistryResult<Vec<KubeContext>> {
    let kubeconfig = read(path).await?;
    let contexts = summarize(&kubeconfig, Some(path));
    log::debug!("kubeconfig: {} context(s) in {}", contexts.len(), path.display());
    Ok(contexts)
}

/// API server URL of `context` (the current context when `None`).
pub async fn server_url(path: &Path, context: Option<&str>) -> RegistryResult<Option<String>> {
    let kubeconfig = read(path).await?;
    let wanted = context
        .map(str::to_string)
        .or_else(|| kubeconfig.current_context.clone())
        .unwrap_or_default();
    Ok(summarize(&kubeconfig, Some(path))
        .into_iter()
        .find(|c| c.name == wanted)
        .and_then(|c| c.server_url))
}

/// Kubeconfig files the user has on this machine: every path in
/// `KUBECONFIG`, or else every regular, non-hidden file in `~/.kube`.
pub fn default_kubeconfig_paths() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    let from_env: Vec<PathBuf> = std::env::var("KUBECONFIG")
        .unwrap_or_default()
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if !from_env.is_empty() {
        return from_env;
    }
    match dirs::home_dir() {
        Some(home) => scan_kube_dir(&home.join(".kube")),
        None => {
            log::warn!("kubeconfig: cannot determine home directory");
            Vec::new()
        }
    }
}

/// Regular, non-hidden files in `dir`, sorted.
fn scan_kube_dir(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("kubeconfig: cannot read directory {}: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| !path.is_dir())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            !name.starts_with('.')
        })
        .collect();
    paths.sort();
    paths
}

/// Contexts across `paths`. Files that are missing or are not kubeconfigs
/// are skipped.
pub async fn discover_contexts(paths: &[PathBuf]) -> Vec<KubeContext> {
    let mut contexts = Vec::new();
    for path in paths {
        match list_contexts(path).await {
            Ok(found) => contexts.extend(found),
            Err(e) => log::info!("kubeconfig: skip {}: {e}", path.display()),
        }
    }
    contexts
}

// ── import ────────────────────────────────────────────────────────────────────

/// Rewrites `current-context`, keeping every other field verbatim.
fn with_current_context(yaml: &str, context: &str) -> RegistryResult<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(invalid)?;
    doc["current-context"] = serde_yaml::Value::String(context.to_string());
    serde_yaml::to_string(&doc).map_err(invalid)
}

/// Validates pasted kubeconfig text and adds one cluster per selected
/// context (every context when `context` is `None`). Each cluster gets its
/// own copy of the text in the store-managed folder, which it then owns,
/// with `current-context` pointing at its context.
pub async fn import_kubeconfig(
    registry: &ClusterRegistry,
    yaml: &str,
    context: Option<&str>,
) -> RegistryResult<Vec<Arc<Cluster>>> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(invalid)?;
    let names: Vec<String> = summarize(&kubeconfig, None)
        .into_iter()
        .map(|c| c.name)
        .filter(|name| context.map_or(true, |wanted| wanted == name))
        .collect();

    if names.is_empty() {
        return Err(match context {
            Some(wanted) => invalid(format!("context {wanted:?} not found")),
            None => invalid("no contexts found"),
        });
    }

    let mut records = Vec::with_capacity(names.len());
    let mut copies = Vec::with_capacity(names.len());
    for name in names {
        let id = ClusterId::generate();
        let path = registry.custom_kubeconfig_path(&id);
        copies.push((path.clone(), with_current_context(yaml, &name)?));
        records.push(ClusterRecord::with_id(id, path, Some(name)));
    }
    write_copies(&copies).await?;

    match registry.add_clusters(records) {
        Ok(clusters) => {
            log::info!("kubeconfig: imported {} context(s)", clusters.len());
            Ok(clusters)
        }
        Err(e) => {
            discard(copies.iter().map(|(path, _)| path.as_path())).await;
            Err(e)
        }
    }
}

/// Writes every copy, or none: a failed write removes the ones before it.
async fn write_copies(copies: &[(PathBuf, String)]) -> RegistryResult<()> {
    for (written, (path, text)) in copies.iter().enumerate() {
        if let Err(e) = write_atomic(path, text.as_bytes()).await {
            discard(copies[..written].iter().map(|(p, _)| p.as_path())).await;
            return Err(e.into());
        }
    }
    Ok(())
}

async fn discard<'a>(paths: impl IntoIterator<Item = &'a Path>) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            log::debug!("kubeconfig: could not remove {}: {e}", path.display());
        }
    }
}

// ── hosted views ──────────────────────────────────────────────────────────────

/// A presentation process is served from `<clusterId>.<host>[:port]`; the
/// id is the second-to-last DNS label.
pub fn cluster_id_from_host(host: &str) -> Option<ClusterId> {
    let hostname = host.split(':').next().unwrap_or_default();
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    let label = labels[labels.len() - 2];
    (!label.is_empty()).then(|| ClusterId::from(label))
}

/// Protocol-relative URL of the view of `id` under `host`.
pub fn cluster_frame_url(id: &ClusterId, host: &str) -> String {
    format!("//{id}.{host}")
}
