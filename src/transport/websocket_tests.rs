use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use super::http::{self, AppState};
use crate::broker::{BrokerLifecycle, LoggingHooks, PublishGateway};
use crate::client::{BusClient, BusMessage, LastMessageSlot, MessageSlot};
use crate::config::{BrokerSettings, BusClientSettings};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Stack {
    http_addr: SocketAddr,
    lifecycle: Arc<BrokerLifecycle>,
    bus: Arc<BusClient>,
    slot: Arc<LastMessageSlot>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl Stack {
    async fn start() -> Self {
        let lifecycle = Arc::new(BrokerLifecycle::new(Arc::new(LoggingHooks)));
        let broker_settings = BrokerSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            timeout_ms: 2000,
            username: String::new(),
            password: String::new(),
            max_connections: 8,
        };
        let broker_addr = lifecycle.start(&broker_settings).await.unwrap();

        let slot = Arc::new(LastMessageSlot::new());
        let bus_settings = BusClientSettings {
            host: "127.0.0.1".to_string(),
            port: broker_addr.port(),
            client_id: "websocketServer".to_string(),
            keep_alive_secs: 30,
            timeout_ms: 2000,
            username: String::new(),
            password: String::new(),
        };
        let bus = Arc::new(
            BusClient::connect(&bus_settings, slot.delivery_callback())
                .await
                .unwrap(),
        );

        let port = portpicker::pick_unused_port().expect("no free port");
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let http_addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let state = AppState {
            bus: bus.clone(),
            slot: slot.clone(),
            gateway: PublishGateway::new(lifecycle.clone()),
            shutdown: shutdown.clone(),
        };
        let server = tokio::spawn(http::serve(listener, state));

        Self {
            http_addr,
            lifecycle,
            bus,
            slot,
            shutdown,
            server,
        }
    }

    async fn ws(&self) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.http_addr))
            .await
            .unwrap();
        ws
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
        self.bus.disconnect().await;
        let _ = self.lifecycle.stop().await;
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    http_request(addr, "GET", path).await
}

/// Minimal HTTP/1.1 request without a body; returns the status code and body.
async fn http_request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn request(ws: &mut WsClient, frame: &str) -> serde_json::Value {
    ws.send(WsMessage::Text(frame.into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no reply")
        .unwrap()
        .unwrap();
    match reply {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn wait_for_slot(slot: &LastMessageSlot, expected: BusMessage) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while slot.load() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot never updated");
}

#[tokio::test]
async fn test_health_probe() {
    let stack = Stack::start().await;

    let (status, body) = http_get(stack.http_addr, "/a").await;
    assert_eq!(status, 200);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, serde_json::json!({ "status": 200, "message": "a" }));

    stack.stop().await;
}

#[tokio::test]
async fn test_plain_request_to_ws_endpoint_is_rejected() {
    let stack = Stack::start().await;

    let (status, _) = http_get(stack.http_addr, "/ws").await;
    assert_eq!(status, 400);

    stack.stop().await;
}

#[tokio::test]
async fn test_non_get_request_to_ws_endpoint_is_rejected() {
    let stack = Stack::start().await;

    for method in ["POST", "PUT", "DELETE"] {
        let (status, _) = http_request(stack.http_addr, method, "/ws").await;
        assert_eq!(status, 400, "{method} /ws");
    }

    stack.stop().await;
}

#[tokio::test]
async fn test_publish_trigger_reaches_websocket_session() {
    let stack = Stack::start().await;
    let mut ws = stack.ws().await;

    let first = request(&mut ws, r#"{"topic":"alerts/kitchen"}"#).await;
    assert_eq!(first, serde_json::json!({ "topic": "", "data": "" }));
    assert_eq!(stack.bus.subscriptions(), vec!["alerts/#"]);

    let (status, body) = http_get(stack.http_addr, "/m/alerts/fire").await;
    assert_eq!(status, 200);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "status": 200, "topic": "alerts", "data": "fire" })
    );

    wait_for_slot(&stack.slot, BusMessage::new("alerts", "fire")).await;

    let second = request(&mut ws, r#"{"topic":"alerts/kitchen"}"#).await;
    assert_eq!(second, serde_json::json!({ "topic": "alerts", "data": "fire" }));

    let retained = stack.lifecycle.broker().lock().retained.contains_key("alerts");
    assert!(retained);

    ws.close(None).await.unwrap();
    stack.stop().await;
}

#[tokio::test]
async fn test_publish_trigger_decodes_path_segments() {
    let stack = Stack::start().await;

    let (status, body) = http_get(stack.http_addr, "/m/alerts/hello%20world").await;
    assert_eq!(status, 200);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["data"], "hello world");

    stack.stop().await;
}

#[tokio::test]
async fn test_publish_trigger_fails_when_broker_stopped() {
    let stack = Stack::start().await;
    stack.lifecycle.stop().await.unwrap();

    let (status, body) = http_get(stack.http_addr, "/m/alerts/fire").await;
    assert_eq!(status, 500);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], 500);
    assert_eq!(stack.slot.load(), BusMessage::default());

    stack.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_over_real_socket() {
    let stack = Stack::start().await;
    let mut ws = stack.ws().await;

    let reply = request(&mut ws, "not json").await;
    assert_eq!(
        reply,
        serde_json::json!({
            "message": "The topic is undefined; below is the data you sent.",
            "data": "not json",
        })
    );
    assert!(stack.bus.subscriptions().is_empty());

    stack.stop().await;
}

#[tokio::test]
async fn test_wildcard_topic_keeps_connection_open() {
    let stack = Stack::start().await;
    let mut ws = stack.ws().await;

    let reply = request(&mut ws, r#"{"topic":"a#b/c"}"#).await;
    assert_eq!(reply["data"], r#"{"topic":"a#b/c"}"#);
    assert!(stack.bus.subscriptions().is_empty());

    let next = request(&mut ws, r#"{"topic":"sensors/temp"}"#).await;
    assert_eq!(next, serde_json::json!({ "topic": "", "data": "" }));
    assert_eq!(stack.bus.subscriptions(), vec!["sensors/#"]);

    ws.close(None).await.unwrap();
    stack.stop().await;
}

#[tokio::test]
async fn test_client_close_is_answered() {
    let stack = Stack::start().await;
    let mut ws = stack.ws().await;

    ws.close(None).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close reply");
    assert!(matches!(next, Some(Ok(WsMessage::Close(_))) | None));

    stack.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_with_going_away() {
    let stack = Stack::start().await;
    let mut ws = stack.ws().await;
    request(&mut ws, r#"{"topic":"sensors"}"#).await;

    stack.shutdown.cancel();

    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close frame")
        .unwrap()
        .unwrap();
    match next {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected a close frame, got {other:?}"),
    }

    stack.stop().await;
}
