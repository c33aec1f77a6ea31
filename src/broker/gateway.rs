//! Publish Gateway
//!
//! Lets the rest of the process put a message on the bus as the internal
//! publisher. Messages are retained and at-least-once so late subscribers
//! still see the last value per topic.

use std::sync::Arc;

use rumqttc::mqttbytes::QoS;
use tracing::debug;

use crate::broker::lifecycle::BrokerLifecycle;
use crate::broker::message::{INTERNAL_SENDER_ID, Message};
use crate::broker::topic::is_valid_topic_name;
use crate::utils::error::PublishError;

#[derive(Debug, Clone)]
pub struct PublishGateway {
    lifecycle: Arc<BrokerLifecycle>,
}

impl PublishGateway {
    pub fn new(lifecycle: Arc<BrokerLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Injects `payload` on `topic` and returns once it has been routed.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if !is_valid_topic_name(topic) {
            return Err(PublishError::InvalidTopic(topic.to_string()));
        }

        let message = Message::new(topic, payload.as_bytes().to_vec(), INTERNAL_SENDER_ID)
            .with_qos(QoS::AtLeastOnce)
            .retained(true);

        let receivers = self
            .lifecycle
            .inject(&message)
            .map_err(|source| PublishError::Broker {
                topic: topic.to_string(),
                source,
            })?;

        debug!(topic, receivers, "injected message");
        Ok(())
    }
}
