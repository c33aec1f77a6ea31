//! Broker engine
//!
//! This module contains the in-memory routing engine of the embedded bus:
//! - managing topic filters and their subscribers
//! - fanning published messages out to every matching subscriber
//! - keeping the last retained message per topic for late subscribers
//!
//! Concurrency and usage notes:
//! - `Broker` is synchronous and meant to sit behind a lock. `BrokerHandle`
//!   owns that lock and is what the listener, the lifecycle manager and the
//!   publish gateway share.
//! - The lock is never held across network I/O: deliveries are pushed into
//!   unbounded per-client channels and hooks fire after the lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rumqttc::mqttbytes::QoS;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::broker::client::Client;
use crate::broker::hooks::HookDispatcher;
use crate::broker::message::{Message, min_qos};
use crate::broker::topic::{SubscriberId, Topic};

#[derive(Debug, Default)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub clients: HashMap<SubscriberId, Client>,
    pub retained: HashMap<String, Message>,
    sessions: HashMap<SubscriberId, Uuid>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connected client and returns its session id.
    ///
    /// A client reusing a connected id takes the session over: the previous
    /// connection is kicked and its subscriptions are dropped.
    pub fn register_client(&mut self, client: Client) -> Uuid {
        let session = Uuid::new_v4();
        let id = client.id.clone();

        if let Some(previous) = self.clients.remove(&id) {
            debug!(client_id = %id, "session takeover, closing previous connection");
            previous.kick.cancel();
            self.drop_subscriptions(&id);
        }

        self.sessions.insert(id.clone(), session);
        self.clients.insert(id, client);
        session
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<Client> {
        self.sessions.remove(client_id);
        self.clients.remove(client_id)
    }

    /// Removes the client registered under `session` and all of its
    /// subscriptions. Does nothing if the id was taken over since.
    pub fn cleanup_client(&mut self, client_id: &str, session: Uuid) -> Option<Client> {
        if self.sessions.get(client_id) != Some(&session) {
            return None;
        }
        self.drop_subscriptions(client_id);
        let client = self.remove_client(client_id);
        debug!(client_id, "cleaned up client");
        client
    }

    fn drop_subscriptions(&mut self, client_id: &str) {
        for topic in self.topics.values_mut() {
            topic.unsubscribe(client_id);
        }
        self.topics.retain(|_, topic| !topic.is_empty());
    }

    /// Subscribes a client to a filter, creating the filter entry if needed.
    ///
    /// Returns the retained messages selected by the filter, already
    /// downgraded to the granted QoS, for the caller to deliver.
    pub fn subscribe(&mut self, filter: &str, subscriber: SubscriberId, qos: QoS) -> Vec<Message> {
        self.topics
            .entry(filter.to_string())
            .or_insert_with(|| Topic::new(filter))
            .subscribe(subscriber, qos);

        let mut retained: Vec<Message> = self
            .retained
            .values()
            .filter(|msg| crate::broker::topic::matches_filter(filter, &msg.topic))
            .map(|msg| {
                let mut msg = msg.clone();
                msg.qos = min_qos(msg.qos, qos);
                msg
            })
            .collect();
        retained.sort_by_key(|msg| msg.timestamp);
        retained
    }

    /// Unsubscribes a client from a filter. Returns whether it was subscribed.
    pub fn unsubscribe(&mut self, filter: &str, subscriber: &str) -> bool {
        let Some(topic) = self.topics.get_mut(filter) else {
            return false;
        };
        let removed = topic.unsubscribe(subscriber);
        if topic.is_empty() {
            self.topics.remove(filter);
        }
        removed
    }

    /// Routes a message to every subscriber whose filter matches its topic.
    ///
    /// Each client receives the message at most once, at the highest QoS it
    /// was granted across its matching filters (capped by the message QoS).
    /// A retained message replaces the stored copy; an empty retained payload
    /// clears it. Returns the number of clients the message was handed to.
    pub fn publish(&mut self, msg: &Message) -> usize {
        if msg.retain {
            if msg.payload.is_empty() {
                self.retained.remove(&msg.topic);
                trace!(topic = %msg.topic, "cleared retained message");
            } else {
                self.retained.insert(msg.topic.clone(), msg.clone());
                trace!(topic = %msg.topic, "stored retained message");
            }
        }

        let mut receivers: HashMap<&str, QoS> = HashMap::new();
        for topic in self.topics.values().filter(|t| t.matches(&msg.topic)) {
            for (sub_id, granted) in &topic.subscribers {
                receivers
                    .entry(sub_id.as_str())
                    .and_modify(|q| {
                        if (*granted as u8) > (*q as u8) {
                            *q = *granted;
                        }
                    })
                    .or_insert(*granted);
            }
        }

        let mut delivered = 0;
        for (sub_id, granted) in receivers {
            let Some(client) = self.clients.get(sub_id) else {
                debug!(client_id = sub_id, "no client registered for subscription");
                continue;
            };

            let mut outgoing = msg.clone();
            outgoing.qos = min_qos(msg.qos, granted);
            // live deliveries never carry the retain flag
            outgoing.retain = false;

            match client.sender.send(outgoing) {
                Ok(()) => delivered += 1,
                Err(_) => debug!(client_id = sub_id, "client channel closed, dropping message"),
            }
        }

        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.topics.values().map(|t| t.subscribers.len()).sum()
    }
}

/// The shared broker: the routing engine plus the hooks that observe it.
#[derive(Debug)]
pub struct BrokerHandle {
    engine: Mutex<Broker>,
    hooks: HookDispatcher,
}

impl BrokerHandle {
    pub fn new(hooks: HookDispatcher) -> Self {
        Self {
            engine: Mutex::new(Broker::new()),
            hooks,
        }
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    /// Locks the engine. The engine holds plain maps, so a poisoned lock is
    /// still consistent and is recovered.
    pub fn lock(&self) -> MutexGuard<'_, Broker> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect_client(&self, client: Client) -> Uuid {
        let (id, endpoint) = (client.id.clone(), client.endpoint.clone());
        let session = self.lock().register_client(client);
        self.hooks.client_connected(&id, &endpoint);
        session
    }

    pub fn disconnect_client(&self, client_id: &str, session: Uuid) {
        let removed = self.lock().cleanup_client(client_id, session);
        if let Some(client) = removed {
            self.hooks.client_disconnected(&client.id, &client.endpoint);
        }
    }

    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Vec<Message> {
        let retained = self.lock().subscribe(filter, client_id.to_string(), qos);
        self.hooks.client_subscribed(client_id, filter);
        retained
    }

    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let removed = self.lock().unsubscribe(filter, client_id);
        if removed {
            self.hooks.client_unsubscribed(client_id, filter);
        }
        removed
    }

    /// Intercepts and routes one message. Returns the number of receivers.
    pub fn publish(&self, msg: &Message) -> usize {
        self.hooks.message_intercepted(msg);
        let delivered = self.lock().publish(msg);
        if delivered == 0 {
            self.hooks.message_undelivered(msg);
        }
        delivered
    }

    /// Drops every client, kicking their connections.
    pub fn disconnect_all(&self) {
        let engine = self.lock();
        for client in engine.clients.values() {
            client.kick.cancel();
        }
    }
}
