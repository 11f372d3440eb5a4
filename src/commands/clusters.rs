use std::path::PathBuf;

use serde_json::Value;
use tauri::State;

use super::AppCoordinator;
use crate::models::cluster::{ClusterId, ClusterRecord};

/// Forwards a webview request to the handler registered on `channel`.
#[tauri::command]
pub async fn ipc_request(
    state: State<'_, AppCoordinator>,
    channel: String,
    payload: Value,
) -> Result<Value, String> {
    state
        .channel()
        .dispatch(&channel, payload)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn list_clusters(state: State<'_, AppCoordinator>) -> Result<Vec<ClusterRecord>, String> {
    Ok(state.registry().list().iter().map(|c| c.record()).collect())
}

#[tauri::command]
pub async fn add_cluster(
    state: State<'_, AppCoordinator>,
    kube_config_path: String,
    context_name: Option<String>,
) -> Result<ClusterRecord, String> {
    let record = ClusterRecord::new(PathBuf::from(kube_config_path), context_name);
    state
        .registry()
        .add_cluster(record)
        .map(|c| c.record())
        .map_err(|e| e.to_string())
}

/// Returns false when no cluster had that id.
#[tauri::command]
pub async fn remove_cluster(state: State<'_, AppCoordinator>, id: String) -> Result<bool, String> {
    Ok(state.registry().remove_by_id(&ClusterId::from(id)).await.is_some())
}
