pub mod clusters;
pub mod kubeconfig;

use crate::coordinator::Coordinator;
use crate::ipc::tauri::TauriChannel;

/// Managed state of the desktop app.
pub type AppCoordinator = Coordinator<TauriChannel>;
