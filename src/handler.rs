//! Event handler registry: event name → user callback.
//!
//! Registration is a setup-time operation. The registry freezes when the
//! server starts accepting connections, so dispatch on the hot path reads
//! an immutable map and takes no lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::Channel;

/// Reserved pseudo-events, dispatched by the session engine rather than by
/// wire name.
pub mod event {
    /// Fired once per channel after the open sequence.
    pub const CONNECTION: &str = "connection";
    /// Fired when the channel reaches its closed state.
    pub const DISCONNECTION: &str = "disconnection";
    /// Fired with `[method, message]` when a user handler fails.
    pub const ERROR: &str = "error";
}

/// What a handler returns: optional reply value (bound into an ACK when the
/// inbound message carried an ack id) or an error routed to the `error`
/// pseudo-event.
pub type HandlerResult = Result<Option<Value>, crate::error::Error>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

pub type BoxHandler = Arc<dyn Fn(Arc<Channel>, Vec<Value>) -> HandlerFuture + Send + Sync>;

pub struct HandlerRegistry {
    building: Mutex<Option<HashMap<String, BoxHandler>>>,
    frozen: OnceLock<Arc<HashMap<String, BoxHandler>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            building: Mutex::new(Some(HashMap::new())),
            frozen: OnceLock::new(),
        }
    }

    /// Register a callback for `name`. Ignored with a warning once the
    /// registry is frozen.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Arc<Channel>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.frozen.get().is_some() {
            tracing::warn!(event = name, "handler registered after first accept; ignored");
            return;
        }
        let boxed: BoxHandler = Arc::new(move |channel, args| Box::pin(handler(channel, args)));
        if let Some(map) = self.building.lock().as_mut() {
            map.insert(name.to_string(), boxed);
        }
    }

    /// Seal the registry. Called when the server begins accepting.
    pub fn freeze(&self) {
        if self.frozen.get().is_some() {
            return;
        }
        let map = self.building.lock().take().unwrap_or_default();
        let _ = self.frozen.set(Arc::new(map));
    }

    pub fn get(&self, name: &str) -> Option<BoxHandler> {
        if let Some(map) = self.frozen.get() {
            return map.get(name).cloned();
        }
        self.building.lock().as_ref().and_then(|m| m.get(name).cloned())
    }
}

/// Bind a handler's return value into ACK reply arguments: an array is the
/// args verbatim, a scalar becomes a one-element array, and no value sends
/// an empty-array ACK.
pub fn ack_args(ret: Option<Value>) -> Vec<Value> {
    match ret {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(value) => vec![value],
    }
}
