pub mod activation;
pub mod bridge;
#[cfg(feature = "desktop")]
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod detectors;
pub mod error;
pub mod ipc;
pub mod kubeconfig;
pub mod models;
pub mod presentation;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Arc;

    use tauri::{Manager, RunEvent};

    use crate::commands::AppCoordinator;
    use crate::config::AppConfig;
    use crate::coordinator::Coordinator;
    use crate::error::StartupError;
    use crate::ipc::tauri::TauriChannel;

    tauri::Builder::default()
        .setup(|app| {
            if cfg!(debug_assertions) {
                app.handle().plugin(
                    tauri_plugin_log::Builder::default()
                        .level(log::LevelFilter::Info)
                        .build(),
                )?;
            }
            let config = AppConfig::from_env().ok_or(StartupError::NoDataDir)?;
            log::info!("coordinator: data dir {}", config.data_dir.display());
            let channel = Arc::new(TauriChannel::new(app.handle().clone()));
            let coordinator = tauri::async_runtime::block_on(Coordinator::start(config, channel))?;
            app.manage(coordinator);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::clusters::ipc_request,
            commands::clusters::list_clusters,
            commands::clusters::add_cluster,
            commands::clusters::remove_cluster,
            commands::kubeconfig::import_kubeconfig,
            commands::kubeconfig::get_kubeconfig_contexts,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                if let Some(coordinator) = app.try_state::<AppCoordinator>() {
                    if let Err(e) = tauri::async_runtime::block_on(coordinator.shutdown()) {
                        log::error!("coordinator: final write failed: {e}");
                    }
                }
            }
        });
}
