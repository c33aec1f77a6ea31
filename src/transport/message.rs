use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Receive buffer size; longer frames are cut to this many bytes.
pub const MAX_FRAME_SIZE: usize = 4096;

pub const UNDEFINED_TOPIC_MESSAGE: &str = "The topic is undefined; below is the data you sent.";

/// A browser asking to follow a topic: `{"topic": "sensors/temp"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRequest {
    pub topic: String,
}

impl TopicRequest {
    /// Parses one frame. Anything other than a JSON object with a string
    /// `topic` yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let topic = value.as_object()?.get("topic")?.as_str()?;
        Some(Self {
            topic: topic.to_string(),
        })
    }

    /// Filter covering everything under the first level of the topic.
    pub fn subscription_filter(&self) -> String {
        let first = self.topic.split('/').next().unwrap_or_default();
        format!("{first}/#")
    }
}

/// Reply carrying the last bus delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicResponse {
    pub topic: String,
    pub data: String,
}

/// Reply to a frame that was not a topic request; echoes what was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndefinedTopicResponse {
    pub message: String,
    pub data: String,
}

impl UndefinedTopicResponse {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            message: UNDEFINED_TOPIC_MESSAGE.to_string(),
            data: raw.into(),
        }
    }
}

/// Decodes a received frame the way a fixed 4 KiB receive buffer would:
/// truncate, drop trailing NUL padding, then lossy UTF-8.
pub fn decode_frame(bytes: &[u8]) -> String {
    let bytes = &bytes[..bytes.len().min(MAX_FRAME_SIZE)];
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
