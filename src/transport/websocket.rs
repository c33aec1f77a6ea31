//! WebSocket Session Handler
//!
//! One loop per connection, strictly request/response: a frame is received,
//! answered, and only then is the next frame read. The loop is generic over
//! the two halves of the socket so it runs unchanged on an axum `WebSocket`
//! or an in-memory channel pair.

use std::fmt::Display;

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broker::topic::is_valid_filter;
use crate::client::{MessageSlot, TopicSubscriber};
use crate::transport::message::{
    TopicRequest, TopicResponse, UndefinedTopicResponse, decode_frame,
};
use crate::utils::error::{BusError, SessionError};

/// How a session ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent a close frame, which was echoed.
    Closed(Option<u16>),
    /// The stream ended without a close frame.
    PeerGone,
    /// The process is shutting down; a 1001 close was sent.
    Shutdown,
}

/// Runs the receive/respond loop until the peer closes or `shutdown` fires.
pub async fn run_session<S, K, E>(
    mut incoming: S,
    mut outgoing: K,
    bus: &dyn TopicSubscriber,
    slot: &dyn MessageSlot,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                let away = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                if let Err(e) = outgoing.send(Message::Close(Some(away))).await {
                    debug!("close on shutdown not delivered: {e}");
                }
                return Ok(SessionEnd::Shutdown);
            }
            frame = incoming.next() => frame,
        };

        let (raw, binary) = match frame {
            None => return Ok(SessionEnd::PeerGone),
            Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => (decode_frame(text.as_str().as_bytes()), false),
            Some(Ok(Message::Binary(bytes))) => (decode_frame(&bytes), true),
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| f.code);
                // the socket may already have answered the close itself
                if let Err(e) = outgoing.send(Message::Close(frame)).await {
                    trace!("close echo not sent: {e}");
                }
                let _ = outgoing.close().await;
                return Ok(SessionEnd::Closed(code));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
        };

        let reply = respond(&raw, bus, slot).await?;
        let reply = if binary {
            Message::Binary(reply.into_bytes().into())
        } else {
            Message::Text(reply.into())
        };

        outgoing
            .send(reply)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
    }
}

/// Builds the JSON reply for one decoded frame.
pub async fn respond(
    raw: &str,
    bus: &dyn TopicSubscriber,
    slot: &dyn MessageSlot,
) -> Result<String, SessionError> {
    let Some(request) = TopicRequest::parse(raw) else {
        debug!("frame is not a topic request");
        return Ok(serde_json::to_string(&UndefinedTopicResponse::new(raw))?);
    };

    let filter = request.subscription_filter();
    if !is_valid_filter(&filter) {
        debug!(topic = %request.topic, %filter, "topic does not yield a valid filter");
        return Ok(serde_json::to_string(&UndefinedTopicResponse::new(raw))?);
    }

    match bus.subscribe(&filter).await {
        Ok(()) => debug!(topic = %request.topic, %filter, "session subscribed"),
        Err(BusError::Closed) => return Err(SessionError::Subscribe(BusError::Closed)),
        // the session still answers with whatever the slot holds
        Err(e) => warn!(%filter, "subscription not granted: {e}"),
    }

    let last = slot.load();
    let response = TopicResponse {
        topic: last.topic,
        data: last.payload,
    };
    Ok(serde_json::to_string(&response)?)
}
