// Summaries of kubeconfig contents handed to the frontend.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeContext {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    pub is_active: bool,
    /// API server URL, used for reachability probes and detectors
    pub server_url: Option<String>,
    /// Absolute path of the kubeconfig file that contains this context
    pub source_file: Option<String>,
}
