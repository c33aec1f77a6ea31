//! Topic management
//!
//! A `Topic` holds the subscribers of one topic filter together with the
//! QoS each of them was granted. Filters follow MQTT rules: levels are
//! separated by `/`, `+` matches exactly one level and `#` matches the
//! remaining levels (including the parent level itself).
//!
//! Concurrency note: callers must synchronize access to `Topic` (for example
//! via the broker lock) when modifying subscriptions.

use std::collections::HashMap;

use rumqttc::mqttbytes::QoS;

pub type SubscriberId = String;

#[derive(Debug)]
pub struct Topic {
    pub filter: String,
    pub subscribers: HashMap<SubscriberId, QoS>,
}

impl Topic {
    /// Create a new topic with the given filter.
    pub fn new(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscriber. A repeated subscription replaces the granted QoS.
    pub fn subscribe(&mut self, id: SubscriberId, qos: QoS) {
        self.subscribers.insert(id, qos);
    }

    /// Remove a subscriber, returning whether it was present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches_filter(&self.filter, topic)
    }
}

/// A topic name a message can be published to: non-empty, no wildcards.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

/// A subscription filter: `+` must fill a whole level, `#` must be the whole
/// last level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// Returns true when `topic` is selected by `filter`.
///
/// Topics starting with `$` are reserved and never matched by a filter whose
/// first level is a wildcard.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
