//! In-process transport: one hub (coordinator end) and any number of
//! attached views (presentation ends). Used by headless setups and tests.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use super::{HandlerTable, Listener, MainChannel, RequestHandler, Subscription, ViewChannel};
use crate::error::{ChannelError, ChannelResult};

#[derive(Default)]
struct HubInner {
    handlers: HandlerTable,
    views: Mutex<Vec<Weak<ViewInner>>>,
}

struct ViewInner {
    listeners: Mutex<Vec<(u64, String, Listener)>>,
    next_listener: AtomicU64,
}

impl ViewInner {
    fn listeners_for(&self, channel: &str) -> Vec<Listener> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, name, _)| name == channel)
            .map(|(_, _, listener)| listener.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new view. Broadcasts sent before this call are not seen.
    pub fn attach(&self) -> LocalView {
        let view = Arc::new(ViewInner {
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        });
        self.inner
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&view));
        LocalView {
            hub: Arc::downgrade(&self.inner),
            inner: view,
        }
    }

    /// Number of views still attached.
    pub fn attached(&self) -> usize {
        self.live_views().len()
    }

    fn live_views(&self) -> Vec<Arc<ViewInner>> {
        let mut views = self.inner.views.lock().unwrap_or_else(PoisonError::into_inner);
        views.retain(|v| v.strong_count() > 0);
        views.iter().filter_map(Weak::upgrade).collect()
    }
}

impl MainChannel for LocalHub {
    fn handle(&self, channel: &str, handler: RequestHandler) -> ChannelResult<()> {
        self.inner.handlers.register(channel, handler)
    }

    fn broadcast(&self, channel: &str, payload: Value) -> ChannelResult<()> {
        let listeners: Vec<Listener> = self
            .live_views()
            .iter()
            .flat_map(|view| view.listeners_for(channel))
            .collect();
        log::trace!("ipc: broadcast {channel} to {} listener(s)", listeners.len());
        for listener in listeners {
            listener(payload.clone());
        }
        Ok(())
    }
}

/// A presentation end. Dropping it detaches from the hub.
pub struct LocalView {
    hub: Weak<HubInner>,
    inner: Arc<ViewInner>,
}

impl ViewChannel for LocalView {
    fn request(&self, channel: &str, payload: Value) -> impl Future<Output = ChannelResult<Value>> + Send {
        let handler = self
            .hub
            .upgrade()
            .ok_or(ChannelError::Detached)
            .and_then(|hub| hub.handlers.get(channel));
        let channel = channel.to_string();
        async move {
            let handler = handler?;
            // Replies never arrive inline on a real transport.
            tokio::task::yield_now().await;
            handler(payload).map_err(|message| ChannelError::Handler { channel, message })
        }
    }

    fn subscribe(&self, channel: &str, listener: Listener) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, channel.to_string(), listener));

        let view = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(view) = view.upgrade() {
                view.listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(other, _, _)| *other != id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, Arc::new(move |_: Value| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn request_reaches_the_single_handler() {
        let hub = LocalHub::new();
        hub.handle(
            "double",
            Arc::new(|v: Value| -> Result<Value, String> { Ok(Value::from(v.as_i64().unwrap_or(0) * 2)) }),
        )
            .unwrap();
        assert!(hub.handle("double", Arc::new(|v: Value| -> Result<Value, String> { Ok(v) })).is_err());

        let view = hub.attach();
        assert_eq!(view.request("double", Value::from(21)).await.unwrap(), Value::from(42));
        assert!(matches!(
            view.request("missing", Value::Null).await,
            Err(ChannelError::NoHandler(_))
        ));
    }

    #[tokio::test]
    async fn handler_errors_are_reported_as_channel_errors() {
        let hub = LocalHub::new();
        hub.handle("fail", Arc::new(|_: Value| -> Result<Value, String> { Err("no state".into()) }))
            .unwrap();
        let view = hub.attach();
        let err = view.request("fail", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChannelError::Handler { message, .. } if message == "no state"));
    }

    #[test]
    fn broadcast_reaches_attached_views_only() {
        let hub = LocalHub::new();
        let early = hub.attach();
        let (early_count, listener) = counter();
        let _early_sub = early.subscribe("news", listener);

        hub.broadcast("news", Value::from(1)).unwrap();

        let late = hub.attach();
        let (late_count, listener) = counter();
        let _late_sub = late.subscribe("news", listener);
        hub.broadcast("other", Value::from(2)).unwrap();

        assert_eq!(early_count.load(Ordering::SeqCst), 1);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);
        assert_eq!(hub.attached(), 2);

        drop(late);
        assert_eq!(hub.attached(), 1);
    }

    #[test]
    fn unsubscribed_listener_stops_receiving() {
        let hub = LocalHub::new();
        let view = hub.attach();
        let (count, listener) = counter();
        let sub = view.subscribe("news", listener);

        hub.broadcast("news", Value::Null).unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        hub.broadcast("news", Value::Null).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requests_fail_once_the_hub_is_gone() {
        let hub = LocalHub::new();
        let view = hub.attach();
        drop(hub);
        assert!(matches!(view.request("any", Value::Null).await, Err(ChannelError::Detached)));
        // Unsubscribing during teardown is still fine.
        view.subscribe("news", Arc::new(|_: Value| {})).unsubscribe();
    }
}
