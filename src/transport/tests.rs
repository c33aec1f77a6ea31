use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::channel::mpsc;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use super::message::{
    MAX_FRAME_SIZE, TopicRequest, TopicResponse, UNDEFINED_TOPIC_MESSAGE, UndefinedTopicResponse,
    decode_frame,
};
use super::websocket::{SessionEnd, run_session};
use crate::client::{BusMessage, LastMessageSlot, MessageSlot, TopicSubscriber};
use crate::utils::error::{BusError, SessionError};

#[derive(Default)]
struct RecordingSubscriber {
    filters: Mutex<Vec<String>>,
}

impl RecordingSubscriber {
    fn filters(&self) -> Vec<String> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicSubscriber for RecordingSubscriber {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.filters.lock().unwrap().push(filter.to_string());
        Ok(())
    }
}

struct FailingSubscriber;

#[async_trait]
impl TopicSubscriber for FailingSubscriber {
    async fn subscribe(&self, _filter: &str) -> Result<(), BusError> {
        Err(BusError::Closed)
    }
}

struct RejectingSubscriber;

#[async_trait]
impl TopicSubscriber for RejectingSubscriber {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        Err(BusError::Rejected(filter.to_string()))
    }
}

/// Simulates a bus delivery landing between the subscribe and the slot read.
struct DeliveringSubscriber {
    slot: Arc<LastMessageSlot>,
}

#[async_trait]
impl TopicSubscriber for DeliveringSubscriber {
    async fn subscribe(&self, _filter: &str) -> Result<(), BusError> {
        self.slot.store(BusMessage::new("alerts", "fire"));
        Ok(())
    }
}

fn text(s: &str) -> Result<Message, Infallible> {
    Ok(Message::Text(s.into()))
}

/// Runs a session over a scripted list of inbound frames and returns what
/// it sent back.
async fn run_scripted(
    frames: Vec<Result<Message, Infallible>>,
    bus: &dyn TopicSubscriber,
    slot: &dyn MessageSlot,
) -> (Result<SessionEnd, SessionError>, Vec<Message>) {
    let (tx, rx) = mpsc::unbounded::<Message>();
    let end = run_session(
        stream::iter(frames),
        tx,
        bus,
        slot,
        &CancellationToken::new(),
    )
    .await;
    (end, rx.collect().await)
}

fn reply_text(msg: &Message) -> &str {
    match msg {
        Message::Text(t) => t.as_str(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[test]
fn test_parse_topic_request() {
    let req = TopicRequest::parse(r#"{"topic":"sensors/temp"}"#).unwrap();
    assert_eq!(req.topic, "sensors/temp");
    assert_eq!(req.subscription_filter(), "sensors/#");

    let extra = TopicRequest::parse(r#"{"topic":"alerts","qos":1}"#).unwrap();
    assert_eq!(extra.subscription_filter(), "alerts/#");
}

#[test]
fn test_parse_rejects_anything_without_string_topic() {
    for raw in [
        "not json",
        "",
        "[]",
        r#""sensors/temp""#,
        r#"{"topik":"sensors"}"#,
        r#"{"topic":42}"#,
        r#"{"topic":null}"#,
        r#"{"topic":"a""#,
    ] {
        assert!(TopicRequest::parse(raw).is_none(), "accepted {raw:?}");
    }
}

#[test]
fn test_subscription_filter_takes_first_segment() {
    let filter = |topic: &str| {
        TopicRequest {
            topic: topic.to_string(),
        }
        .subscription_filter()
    };
    assert_eq!(filter("a/b/c/d"), "a/#");
    assert_eq!(filter("single"), "single/#");
    assert_eq!(filter("/leading"), "/#");
    assert_eq!(filter(""), "/#");
}

#[test]
fn test_decode_frame_strips_padding_and_truncates() {
    assert_eq!(decode_frame(b"hello\0\0\0"), "hello");
    assert_eq!(decode_frame(b"\0\0"), "");
    assert_eq!(decode_frame(b"in\0side"), "in\0side");

    let long = vec![b'x'; MAX_FRAME_SIZE + 100];
    assert_eq!(decode_frame(&long).len(), MAX_FRAME_SIZE);
}

#[test]
fn test_response_field_names() {
    let ok = serde_json::to_string(&TopicResponse {
        topic: "sensors/temp".into(),
        data: "21.5".into(),
    })
    .unwrap();
    assert_eq!(ok, r#"{"topic":"sensors/temp","data":"21.5"}"#);

    let undefined = serde_json::to_string(&UndefinedTopicResponse::new("x")).unwrap();
    assert_eq!(
        undefined,
        format!(r#"{{"message":"{UNDEFINED_TOPIC_MESSAGE}","data":"x"}}"#)
    );
}

#[tokio::test]
async fn test_valid_request_subscribes_and_returns_slot() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    slot.store(BusMessage::new("sensors/temp", "21.5"));

    let (end, sent) = run_scripted(vec![text(r#"{"topic":"sensors/temp"}"#)], &bus, &slot).await;

    assert_eq!(end.unwrap(), SessionEnd::PeerGone);
    assert_eq!(bus.filters(), vec!["sensors/#"]);
    assert_eq!(sent.len(), 1);
    assert_eq!(reply_text(&sent[0]), r#"{"topic":"sensors/temp","data":"21.5"}"#);
}

#[tokio::test]
async fn test_malformed_request_echoes_raw_text() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    slot.store(BusMessage::new("sensors/temp", "21.5"));

    let (_, sent) = run_scripted(
        vec![text("not json"), text(r#"{"channel":"sensors"}"#)],
        &bus,
        &slot,
    )
    .await;

    assert!(bus.filters().is_empty());
    assert_eq!(sent.len(), 2);
    assert_eq!(
        reply_text(&sent[0]),
        r#"{"message":"The topic is undefined; below is the data you sent.","data":"not json"}"#
    );
    let second: UndefinedTopicResponse = serde_json::from_str(reply_text(&sent[1])).unwrap();
    assert_eq!(second.data, r#"{"channel":"sensors"}"#);
}

#[tokio::test]
async fn test_slot_is_read_regardless_of_requested_topic() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    slot.store(BusMessage::new("alerts", "fire"));

    let (_, sent) = run_scripted(vec![text(r#"{"topic":"sensors/temp"}"#)], &bus, &slot).await;

    let reply: TopicResponse = serde_json::from_str(reply_text(&sent[0])).unwrap();
    assert_eq!(reply.topic, "alerts");
    assert_eq!(reply.data, "fire");
}

#[tokio::test]
async fn test_repeated_request_subscribes_each_time() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    let request = r#"{"topic":"sensors/temp"}"#;

    let (_, sent) = run_scripted(vec![text(request), text(request)], &bus, &slot).await;

    assert_eq!(bus.filters(), vec!["sensors/#", "sensors/#"]);
    assert_eq!(sent.len(), 2);
    assert_eq!(reply_text(&sent[1]), r#"{"topic":"","data":""}"#);
}

#[tokio::test]
async fn test_delivery_during_subscribe_is_observed() {
    let slot = Arc::new(LastMessageSlot::new());
    let bus = DeliveringSubscriber { slot: slot.clone() };

    let (_, sent) = run_scripted(vec![text(r#"{"topic":"alerts/x"}"#)], &bus, &*slot).await;

    assert_eq!(reply_text(&sent[0]), r#"{"topic":"alerts","data":"fire"}"#);
}

#[tokio::test]
async fn test_close_is_echoed_once_and_ends_session() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    let close = CloseFrame {
        code: close_code::NORMAL,
        reason: "bye".into(),
    };

    let (end, sent) = run_scripted(
        vec![
            text(r#"{"topic":"a"}"#),
            Ok(Message::Close(Some(close.clone()))),
            text(r#"{"topic":"b"}"#),
        ],
        &bus,
        &slot,
    )
    .await;

    assert_eq!(end.unwrap(), SessionEnd::Closed(Some(close_code::NORMAL)));
    assert_eq!(bus.filters(), vec!["a/#"]);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], Message::Close(Some(close)));
}

#[tokio::test]
async fn test_binary_frame_gets_binary_reply() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();

    let (_, sent) = run_scripted(
        vec![Ok(Message::Binary(b"not json\0\0\0\0".to_vec().into()))],
        &bus,
        &slot,
    )
    .await;

    match &sent[0] {
        Message::Binary(bytes) => {
            let reply: UndefinedTopicResponse = serde_json::from_slice(bytes).unwrap();
            assert_eq!(reply.data, "not json");
        }
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_frame_is_truncated() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    let big = "y".repeat(MAX_FRAME_SIZE * 2);

    let (_, sent) = run_scripted(vec![text(&big)], &bus, &slot).await;

    let reply: UndefinedTopicResponse = serde_json::from_str(reply_text(&sent[0])).unwrap();
    assert_eq!(reply.data.len(), MAX_FRAME_SIZE);
}

#[tokio::test]
async fn test_ping_produces_no_reply() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();

    let (_, sent) = run_scripted(
        vec![Ok(Message::Ping(b"hi".to_vec().into())), text("x")],
        &bus,
        &slot,
    )
    .await;

    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn test_subscribe_failure_ends_session() {
    let slot = LastMessageSlot::new();

    let (end, sent) = run_scripted(
        vec![text(r#"{"topic":"a"}"#), text("never read")],
        &FailingSubscriber,
        &slot,
    )
    .await;

    assert!(matches!(end, Err(SessionError::Subscribe(BusError::Closed))));
    assert!(sent.is_empty());
}

#[tokio::test]
async fn test_wildcard_in_topic_gets_diagnostic_and_session_continues() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    slot.store(BusMessage::new("alerts", "fire"));

    let (end, sent) = run_scripted(
        vec![
            text(r#"{"topic":"a#b/c"}"#),
            text(r#"{"topic":"+x"}"#),
            text(r#"{"topic":"alerts"}"#),
        ],
        &bus,
        &slot,
    )
    .await;

    assert_eq!(end.unwrap(), SessionEnd::PeerGone);
    assert_eq!(bus.filters(), vec!["alerts/#"]);
    assert_eq!(sent.len(), 3);
    let first: UndefinedTopicResponse = serde_json::from_str(reply_text(&sent[0])).unwrap();
    assert_eq!(first.message, UNDEFINED_TOPIC_MESSAGE);
    assert_eq!(first.data, r#"{"topic":"a#b/c"}"#);
    let second: UndefinedTopicResponse = serde_json::from_str(reply_text(&sent[1])).unwrap();
    assert_eq!(second.data, r#"{"topic":"+x"}"#);
    assert_eq!(reply_text(&sent[2]), r#"{"topic":"alerts","data":"fire"}"#);
}

#[tokio::test]
async fn test_refused_subscription_still_answers_from_slot() {
    let slot = LastMessageSlot::new();
    slot.store(BusMessage::new("alerts", "fire"));

    let (end, sent) = run_scripted(
        vec![text(r#"{"topic":"alerts"}"#), text(r#"{"topic":"sensors"}"#)],
        &RejectingSubscriber,
        &slot,
    )
    .await;

    assert_eq!(end.unwrap(), SessionEnd::PeerGone);
    assert_eq!(sent.len(), 2);
    assert_eq!(reply_text(&sent[0]), r#"{"topic":"alerts","data":"fire"}"#);
    assert_eq!(reply_text(&sent[1]), r#"{"topic":"alerts","data":"fire"}"#);
}

#[tokio::test]
async fn test_shutdown_sends_going_away() {
    let bus = RecordingSubscriber::default();
    let slot = LastMessageSlot::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let (tx, rx) = mpsc::unbounded::<Message>();
    let end = run_session(
        stream::pending::<Result<Message, Infallible>>(),
        tx,
        &bus,
        &slot,
        &shutdown,
    )
    .await;

    assert_eq!(end.unwrap(), SessionEnd::Shutdown);
    let sent: Vec<Message> = rx.collect().await;
    match sent.as_slice() {
        [Message::Close(Some(frame))] => assert_eq!(frame.code, close_code::AWAY),
        other => panic!("expected a single close frame, got {other:?}"),
    }
}
