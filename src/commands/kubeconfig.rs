use std::path::PathBuf;

use tauri::State;

use super::AppCoordinator;
use crate::kubeconfig;
use crate::models::cluster::ClusterRecord;
use crate::models::k8s::KubeContext;

/// Lists contexts of one kubeconfig file, or of every kubeconfig the user
/// has (`KUBECONFIG`, else `~/.kube/*`) when no path is given.
///
/// Returns an empty vec, not an error, when nothing can be found.
#[tauri::command]
pub async fn get_kubeconfig_contexts(path: Option<String>) -> Result<Vec<KubeContext>, String> {
    match path {
        Some(path) => kubeconfig::list_contexts(&PathBuf::from(path))
            .await
            .map_err(|e| e.to_string()),
        None => {
            let paths = kubeconfig::default_kubeconfig_paths();
            log::info!("kubeconfig: {} candidate file(s)", paths.len());
            Ok(kubeconfig::discover_contexts(&paths).await)
        }
    }
}

/// Adds clusters from pasted kubeconfig text.
#[tauri::command]
pub async fn import_kubeconfig(
    state: State<'_, AppCoordinator>,
    yaml: String,
    context_name: Option<String>,
) -> Result<Vec<ClusterRecord>, String> {
    let clusters = kubeconfig::import_kubeconfig(state.registry(), &yaml, context_name.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    Ok(clusters.iter().map(|c| c.record()).collect())
}
