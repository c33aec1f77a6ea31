//! Broker lifecycle and audit hooks.
//!
//! `BrokerHooks` is a fixed set of named callback slots. The broker calls
//! them through [`HookDispatcher`], which enforces the firing contract:
//!
//! - hooks are advisory and never influence routing
//! - they run inline on the broker task, so they must return quickly
//! - a panicking hook is caught and logged, never propagated
//! - messages from [`crate::broker::INTERNAL_SENDER_ID`] never reach `on_message_intercepted`

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{error, info};

use crate::broker::message::Message;

pub trait BrokerHooks: Send + Sync {
    fn on_started(&self, _addr: &str) {}

    fn on_stopped(&self) {}

    fn on_client_connected(&self, _client_id: &str, _endpoint: &str) {}

    fn on_client_disconnected(&self, _client_id: &str, _endpoint: &str) {}

    fn on_client_subscribed(&self, _client_id: &str, _topic_filter: &str) {}

    fn on_client_unsubscribed(&self, _client_id: &str, _topic_filter: &str) {}

    /// A client published `message`; called before it is routed.
    fn on_message_intercepted(&self, _client_id: &str, _message: &Message) {}

    /// `message` matched no subscriber.
    fn on_message_undelivered(&self, _sender_id: &str, _message: &Message) {}
}

/// Hooks that do nothing. Handy for tests and embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BrokerHooks for NoopHooks {}

/// Production hooks: one structured log event per broker event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl BrokerHooks for LoggingHooks {
    fn on_started(&self, addr: &str) {
        info!(%addr, "mqtt broker started");
    }

    fn on_stopped(&self) {
        info!("mqtt broker stopped");
    }

    fn on_client_connected(&self, client_id: &str, endpoint: &str) {
        info!(client_id, endpoint, "bus client connected");
    }

    fn on_client_disconnected(&self, client_id: &str, endpoint: &str) {
        info!(client_id, endpoint, "bus client disconnected");
    }

    fn on_client_subscribed(&self, client_id: &str, topic_filter: &str) {
        info!(client_id, topic_filter, "bus client subscribed");
    }

    fn on_client_unsubscribed(&self, client_id: &str, topic_filter: &str) {
        info!(client_id, topic_filter, "bus client unsubscribed");
    }

    fn on_message_intercepted(&self, client_id: &str, message: &Message) {
        info!(
            client_id,
            topic = %message.topic,
            payload = %message.payload_text(),
            qos = ?message.qos,
            "publish intercepted"
        );
    }

    fn on_message_undelivered(&self, sender_id: &str, message: &Message) {
        info!(
            publisher_id = sender_id,
            topic = %message.topic,
            payload = %message.payload_text(),
            qos = ?message.qos,
            "message not consumed by any subscriber"
        );
    }
}

/// Invokes hooks under the firing contract described in the module docs.
#[derive(Clone)]
pub struct HookDispatcher {
    hooks: Arc<dyn BrokerHooks>,
}

impl HookDispatcher {
    pub fn new(hooks: Arc<dyn BrokerHooks>) -> Self {
        Self { hooks }
    }

    fn fire(&self, hook: &'static str, f: impl FnOnce(&dyn BrokerHooks)) {
        let hooks = self.hooks.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(hooks))).is_err() {
            error!(hook, "broker hook panicked; event dropped");
        }
    }

    pub fn started(&self, addr: &str) {
        self.fire("started", |h| h.on_started(addr));
    }

    pub fn stopped(&self) {
        self.fire("stopped", |h| h.on_stopped());
    }

    pub fn client_connected(&self, client_id: &str, endpoint: &str) {
        self.fire("client_connected", |h| h.on_client_connected(client_id, endpoint));
    }

    pub fn client_disconnected(&self, client_id: &str, endpoint: &str) {
        self.fire("client_disconnected", |h| {
            h.on_client_disconnected(client_id, endpoint)
        });
    }

    pub fn client_subscribed(&self, client_id: &str, topic_filter: &str) {
        self.fire("client_subscribed", |h| {
            h.on_client_subscribed(client_id, topic_filter)
        });
    }

    pub fn client_unsubscribed(&self, client_id: &str, topic_filter: &str) {
        self.fire("client_unsubscribed", |h| {
            h.on_client_unsubscribed(client_id, topic_filter)
        });
    }

    pub fn message_intercepted(&self, message: &Message) {
        if message.is_internal() {
            return;
        }
        self.fire("message_intercepted", |h| {
            h.on_message_intercepted(&message.sender_id, message)
        });
    }

    pub fn message_undelivered(&self, message: &Message) {
        self.fire("message_undelivered", |h| {
            h.on_message_undelivered(&message.sender_id, message)
        });
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher").finish_non_exhaustive()
    }
}
