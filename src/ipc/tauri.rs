//! Coordinator end on a Tauri app: broadcasts are Tauri events, requests
//! arrive through the `ipc_request` command.

use serde_json::Value;
use tauri::{AppHandle, Emitter, Runtime, Wry};

use super::{HandlerTable, MainChannel, RequestHandler};
use crate::error::{ChannelError, ChannelResult};

pub struct TauriChannel<R: Runtime = Wry> {
    app: AppHandle<R>,
    handlers: HandlerTable,
}

impl<R: Runtime> TauriChannel<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self {
            app,
            handlers: HandlerTable::default(),
        }
    }

    /// Answers a request forwarded by a webview.
    pub fn dispatch(&self, channel: &str, payload: Value) -> ChannelResult<Value> {
        self.handlers.dispatch(channel, payload)
    }
}

impl<R: Runtime> MainChannel for TauriChannel<R> {
    fn handle(&self, channel: &str, handler: RequestHandler) -> ChannelResult<()> {
        self.handlers.register(channel, handler)
    }

    fn broadcast(&self, channel: &str, payload: Value) -> ChannelResult<()> {
        self.app.emit(channel, payload).map_err(|e| ChannelError::Transport {
            channel: channel.to_string(),
            message: e.to_string(),
        })
    }
}
