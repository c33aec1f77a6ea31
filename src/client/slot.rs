use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::trace;

use crate::client::bus_client::DeliveryCallback;

/// One delivery from the bus, payload already decoded as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Builds a message from raw bus bytes. Invalid UTF-8 is replaced.
    pub fn from_bytes(topic: &str, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload))
    }
}

/// Holder of the most recent bus delivery.
///
/// Reads and writes are whole-pair swaps; a reader never sees the topic of
/// one delivery with the payload of another.
pub trait MessageSlot: Send + Sync {
    fn store(&self, message: BusMessage);
    fn load(&self) -> BusMessage;
}

/// Process-wide last-write-wins slot. Starts with an empty pair.
#[derive(Debug, Default)]
pub struct LastMessageSlot {
    current: RwLock<BusMessage>,
}

impl LastMessageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus client callback feeding this slot.
    pub fn delivery_callback(self: &Arc<Self>) -> DeliveryCallback {
        let slot = Arc::clone(self);
        Box::new(move |topic: &str, payload: &[u8]| {
            trace!(topic, bytes = payload.len(), "bus delivery");
            slot.store(BusMessage::from_bytes(topic, payload));
        })
    }
}

impl MessageSlot for LastMessageSlot {
    fn store(&self, message: BusMessage) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = message;
    }

    fn load(&self) -> BusMessage {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
