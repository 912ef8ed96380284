use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use super::registry::{Callback, CallbackId, Registry};
use super::types::response::{InboundMessage, parse_messages};
use crate::ws::{FrameSink, Handler};

/// Broadcast channel capacity for [`Router::subscribe`] receivers.
const BROADCAST_CAPACITY: usize = 1024;

/// Parses inbound frames and fans each message out.
///
/// Every parsed message goes to the global observers first, then to the
/// callbacks of the feed whose composed key equals the message's `channel`,
/// then to stream receivers. Frames that fail to parse reach nobody.
pub struct Router {
    registry: Arc<Registry>,
    observers: RwLock<BTreeMap<CallbackId, Callback>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<InboundMessage>,
}

impl Router {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry,
            observers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a callback for every message regardless of channel.
    pub fn add_observer(&self, callback: Callback) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        id
    }

    /// Remove a global observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: CallbackId) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive every parsed message. Each call returns an independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Parse one raw frame and deliver its messages. Never panics or fails.
    pub fn handle_frame(&self, raw: &str) {
        let messages = match parse_messages(raw.as_bytes()) {
            Ok(messages) => messages,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%raw, error = %e, "Failed to parse feed message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        for message in &messages {
            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: &InboundMessage) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let observers: Vec<Callback> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for observer in &observers {
            invoke(observer, message);
        }
        for callback in &self.registry.callbacks(&message.channel) {
            invoke(callback, message);
        }

        if self.broadcast_tx.receiver_count() > 0 {
            _ = self.broadcast_tx.send(message.clone());
        }
    }
}

/// Run a consumer callback, containing any panic so delivery continues.
fn invoke(callback: &Callback, message: &InboundMessage) {
    if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!(channel = %message.channel, "Feed callback panicked");
    }
}

impl Handler for Router {
    fn on_open(&self, sink: &dyn FrameSink) {
        self.registry.resubscribe_all(sink);
    }

    fn on_frame(&self, text: &str) {
        self.handle_frame(text);
    }
}
