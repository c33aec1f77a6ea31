//! Message definitions for the bus
//!
//! `Message` is what the broker routes: a topic, an opaque payload, the QoS
//! it was published with, the retain flag and the id of the client that
//! published it. `timestamp` is set by the broker when the message is
//! accepted (milliseconds since UNIX epoch).

use bytes::Bytes;
use rumqttc::mqttbytes::QoS;

/// Sender identity used for messages injected by the gateway itself.
pub const INTERNAL_SENDER_ID: &str = "mainServer";

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub sender_id: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, sender_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            sender_id: sender_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload as text; invalid UTF-8 is replaced, not rejected.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn is_internal(&self) -> bool {
        self.sender_id == INTERNAL_SENDER_ID
    }
}

/// Lower of two QoS levels, used when a subscriber was granted less than the
/// publisher asked for.
pub fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) { a } else { b }
}
