//! Channels between the coordinator and presentation processes.
//!
//! Two primitives: request/response (view → coordinator, exactly one
//! handler per channel) and broadcast (coordinator → every attached view,
//! no replay). Payloads are JSON values so any transport can carry them.

pub mod local;
#[cfg(feature = "desktop")]
pub mod tauri;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};

pub mod channels {
    /// Snapshot pull of every cluster's live state.
    pub const CLUSTER_STATES: &str = "cluster:states";
    /// Push of one cluster's live state.
    pub const CLUSTER_STATE: &str = "cluster:state";
    pub const CLUSTER_ACTIVATE: &str = "cluster:activate";
    pub const CLUSTER_DISCONNECT: &str = "cluster:disconnect";
}

pub type RequestHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Coordinator end.
pub trait MainChannel: Send + Sync {
    /// Registers the single handler of `channel`.
    fn handle(&self, channel: &str, handler: RequestHandler) -> ChannelResult<()>;

    /// Delivers `payload` to every view attached right now.
    fn broadcast(&self, channel: &str, payload: Value) -> ChannelResult<()>;
}

/// Presentation end.
pub trait ViewChannel: Send + Sync {
    fn request(&self, channel: &str, payload: Value) -> impl Future<Output = ChannelResult<Value>> + Send;

    fn subscribe(&self, channel: &str, listener: Listener) -> Subscription;
}

/// Handle returned by [`ViewChannel::subscribe`]. Unsubscribes on drop;
/// `unsubscribe` may be called any number of times.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A token for a subscription that never happened.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.cancel.lock().map(|c| c.is_some()).unwrap_or(false);
        f.debug_struct("Subscription").field("active", &active).finish()
    }
}

/// Handler table shared by the transports: one handler per channel.
#[derive(Default)]
pub struct HandlerTable {
    handlers: Mutex<HashMap<String, RequestHandler>>,
}

impl HandlerTable {
    pub fn register(&self, channel: &str, handler: RequestHandler) -> ChannelResult<()> {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(channel) {
            return Err(ChannelError::HandlerAlreadyRegistered(channel.to_string()));
        }
        handlers.insert(channel.to_string(), handler);
        log::debug!("ipc: handler registered on {channel}");
        Ok(())
    }

    pub fn get(&self, channel: &str) -> ChannelResult<RequestHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .ok_or_else(|| ChannelError::NoHandler(channel.to_string()))
    }

    /// Runs the handler of `channel` on `payload`.
    pub fn dispatch(&self, channel: &str, payload: Value) -> ChannelResult<Value> {
        let handler = self.get(channel)?;
        handler(payload).map_err(|message| ChannelError::Handler {
            channel: channel.to_string(),
            message,
        })
    }
}

/// Registers a handler that speaks serde types instead of raw JSON.
pub fn handle_typed<M, Req, Resp, F>(main: &M, channel: &str, f: F) -> ChannelResult<()>
where
    M: MainChannel + ?Sized,
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    F: Fn(Req) -> Result<Resp, String> + Send + Sync + 'static,
{
    main.handle(
        channel,
        Arc::new(move |payload: Value| {
            let request: Req = serde_json::from_value(payload).map_err(|e| format!("bad request: {e}"))?;
            let response = f(request)?;
            serde_json::to_value(response).map_err(|e| e.to_string())
        }),
    )
}

pub fn broadcast_typed<M, T>(main: &M, channel: &str, payload: &T) -> ChannelResult<()>
where
    M: MainChannel + ?Sized,
    T: Serialize,
{
    main.broadcast(channel, serde_json::to_value(payload)?)
}

pub async fn request_typed<V, Req, Resp>(view: &V, channel: &str, request: &Req) -> ChannelResult<Resp>
where
    V: ViewChannel + ?Sized,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_value(request)?;
    let reply = view.request(channel, payload).await?;
    Ok(serde_json::from_value(reply)?)
}
