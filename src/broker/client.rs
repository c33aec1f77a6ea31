use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::broker::message::Message;

/// Represents a bus client connected to the embedded broker.
///
/// The broker pushes routed messages into `sender`; the connection task on
/// the other end encodes them onto the wire. Cancelling `kick` forces the
/// connection task to close, which is how a session takeover is enforced.
#[derive(Debug)]
pub struct Client {
    /// MQTT client identifier.
    pub id: String,

    /// Remote endpoint, for logging.
    pub endpoint: String,

    /// Channel to the connection task.
    pub sender: UnboundedSender<Message>,

    pub kick: CancellationToken,
}

impl Client {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, sender: UnboundedSender<Message>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            sender,
            kick: CancellationToken::new(),
        }
    }
}
