//! MQTT listener
//!
//! Accepts TCP connections speaking MQTT 3.1.1 and bridges each of them to
//! the shared [`BrokerHandle`]. Packets are framed with the
//! `rumqttc::mqttbytes::v4` codec. Delivery is best-effort once: no
//! retransmission and no persistent sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broker::client::Client;
use crate::broker::engine::BrokerHandle;
use crate::broker::message::{Message, min_qos};
use crate::broker::topic::{is_valid_filter, is_valid_topic_name};

/// Largest packet accepted from or written to a bus client.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Highest QoS granted to subscribers.
const MAX_GRANTED_QOS: QoS = QoS::AtLeastOnce;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0:?}")]
    Codec(mqttbytes::Error),

    #[error("timed out")]
    Timeout,

    #[error("peer closed the connection")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<mqttbytes::Error> for ConnectionError {
    fn from(e: mqttbytes::Error) -> Self {
        ConnectionError::Codec(e)
    }
}

/// Settings shared by every connection of one listener.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub broker: Arc<BrokerHandle>,
    /// Bounds the wait for CONNECT and every packet write.
    pub timeout: Duration,
    pub connections: Arc<Semaphore>,
}

impl ListenerContext {
    pub fn new(broker: Arc<BrokerHandle>, timeout: Duration, max_connections: usize) -> Self {
        Self {
            broker,
            timeout,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }
}

/// Accept loop. Returns once `shutdown` is cancelled and every connection
/// task has finished.
pub async fn serve(listener: TcpListener, ctx: ListenerContext, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let shutdown = shutdown.child_token();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, ctx, shutdown).await {
                            debug!(%peer, "bus connection ended: {e}");
                        }
                    });
                }
                Err(e) => warn!("failed to accept bus connection: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    info!("mqtt listener closed");
}

/// Reads and writes whole MQTT packets on a TCP stream.
struct PacketStream {
    stream: TcpStream,
    read: BytesMut,
    write: BytesMut,
    write_timeout: Duration,
}

impl PacketStream {
    fn new(stream: TcpStream, write_timeout: Duration) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4 * 1024),
            write: BytesMut::with_capacity(4 * 1024),
            write_timeout,
        }
    }

    /// Cancel safe: partial packets stay buffered until the next call.
    async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            match v4::read(&mut self.read, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.read).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    async fn write_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.write.clear();
        let buf = &mut self.write;
        match &packet {
            Packet::ConnAck(ack) => ack.write(buf)?,
            Packet::Publish(publish) => publish.write(buf)?,
            Packet::PubAck(ack) => ack.write(buf)?,
            Packet::PubRec(rec) => rec.write(buf)?,
            Packet::PubComp(comp) => comp.write(buf)?,
            Packet::SubAck(ack) => ack.write(buf)?,
            Packet::UnsubAck(ack) => ack.write(buf)?,
            Packet::PingResp => PingResp.write(buf)?,
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "broker never sends {other:?}"
                )));
            }
        };
        let result = timeout(self.write_timeout, self.stream.write_all(&self.write)).await;
        self.write.clear();
        match result {
            Ok(written) => Ok(written?),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }
}

/// Per-connection state once CONNECT has been accepted.
struct Connection {
    client_id: String,
    packets: PacketStream,
    next_pkid: u16,
    keep_alive: Option<Duration>,
}

impl Connection {
    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1);
        if self.next_pkid == 0 {
            self.next_pkid = 1;
        }
        self.next_pkid
    }

    async fn deliver(&mut self, msg: Message) -> Result<(), ConnectionError> {
        let pkid = match msg.qos {
            QoS::AtMostOnce => 0,
            _ => self.next_pkid(),
        };
        let publish = Publish {
            dup: false,
            qos: msg.qos,
            retain: msg.retain,
            topic: msg.topic,
            pkid,
            payload: msg.payload,
        };
        self.packets.write_packet(Packet::Publish(publish)).await
    }

    fn deadline(&self) -> Option<Instant> {
        self.keep_alive.map(|k| Instant::now() + k)
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ListenerContext,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    let endpoint = peer.to_string();
    let mut packets = PacketStream::new(stream, ctx.timeout);

    let connect = match timeout(ctx.timeout, packets.read_packet()).await {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(other)) => {
            return Err(ConnectionError::Protocol(format!(
                "expected CONNECT, got {other:?}"
            )));
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(ConnectionError::Timeout),
    };

    let Ok(_permit) = ctx.connections.clone().try_acquire_owned() else {
        warn!(%endpoint, "connection limit reached, refusing bus client");
        let refused = ConnAck::new(ConnectReturnCode::ServiceUnavailable, false);
        packets.write_packet(Packet::ConnAck(refused)).await?;
        return Ok(());
    };

    let client_id = if connect.client_id.is_empty() {
        format!("auto-{}", Uuid::new_v4())
    } else {
        connect.client_id.clone()
    };

    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let client = Client::new(client_id.clone(), endpoint.clone(), tx);
    let kick = client.kick.clone();
    let session = ctx.broker.connect_client(client);

    // 1.5x keep-alive before a silent client is dropped
    let keep_alive = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

    let mut conn = Connection {
        client_id: client_id.clone(),
        packets,
        next_pkid: 0,
        keep_alive,
    };

    let result = run_connection(&mut conn, &ctx, rx, &kick, &shutdown).await;

    ctx.broker.disconnect_client(&client_id, session);
    result
}

async fn run_connection(
    conn: &mut Connection,
    ctx: &ListenerContext,
    mut rx: mpsc::UnboundedReceiver<Message>,
    kick: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError> {
    let ack = ConnAck::new(ConnectReturnCode::Success, false);
    conn.packets.write_packet(Packet::ConnAck(ack)).await?;

    let mut deadline = conn.deadline();

    loop {
        let expiry = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = kick.cancelled() => {
                debug!(client_id = %conn.client_id, "connection taken over");
                return Ok(());
            }
            _ = expiry => {
                warn!(client_id = %conn.client_id, "keep-alive expired");
                return Err(ConnectionError::Timeout);
            }
            Some(msg) = rx.recv() => conn.deliver(msg).await?,
            packet = conn.packets.read_packet() => {
                deadline = conn.deadline();
                if !handle_packet(conn, ctx, packet?).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// Handles one inbound packet. Returns `false` when the client disconnected.
async fn handle_packet(
    conn: &mut Connection,
    ctx: &ListenerContext,
    packet: Packet,
) -> Result<bool, ConnectionError> {
    match packet {
        Packet::Publish(publish) => {
            if !is_valid_topic_name(&publish.topic) {
                return Err(ConnectionError::Protocol(format!(
                    "invalid topic name `{}`",
                    publish.topic
                )));
            }

            let pkid = publish.pkid;
            let qos = publish.qos;
            let msg = Message::new(publish.topic, publish.payload, conn.client_id.clone())
                .with_qos(qos)
                .retained(publish.retain);
            ctx.broker.publish(&msg);

            match qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    conn.packets
                        .write_packet(Packet::PubAck(PubAck::new(pkid)))
                        .await?
                }
                QoS::ExactlyOnce => {
                    conn.packets
                        .write_packet(Packet::PubRec(PubRec::new(pkid)))
                        .await?
                }
            }
        }
        Packet::PubRel(pubrel) => {
            conn.packets
                .write_packet(Packet::PubComp(PubComp::new(pubrel.pkid)))
                .await?;
        }
        Packet::PubAck(puback) => {
            trace!(client_id = %conn.client_id, pkid = puback.pkid, "delivery acknowledged");
        }
        Packet::Subscribe(subscribe) => {
            let mut return_codes = Vec::with_capacity(subscribe.filters.len());
            let mut retained = Vec::new();

            for filter in subscribe.filters {
                if !is_valid_filter(&filter.path) {
                    warn!(client_id = %conn.client_id, filter = %filter.path, "refusing invalid topic filter");
                    return_codes.push(SubscribeReasonCode::Failure);
                    continue;
                }
                let granted = min_qos(filter.qos, MAX_GRANTED_QOS);
                retained.extend(ctx.broker.subscribe(&conn.client_id, &filter.path, granted));
                return_codes.push(SubscribeReasonCode::Success(granted));
            }

            let suback = SubAck::new(subscribe.pkid, return_codes);
            conn.packets.write_packet(Packet::SubAck(suback)).await?;

            for msg in retained {
                conn.deliver(msg).await?;
            }
        }
        Packet::Unsubscribe(unsubscribe) => {
            for filter in &unsubscribe.topics {
                ctx.broker.unsubscribe(&conn.client_id, filter);
            }
            conn.packets
                .write_packet(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
                .await?;
        }
        Packet::PingReq => conn.packets.write_packet(Packet::PingResp).await?,
        Packet::Disconnect => {
            debug!(client_id = %conn.client_id, "client sent DISCONNECT");
            return Ok(false);
        }
        Packet::Connect(_) => {
            return Err(ConnectionError::Protocol("second CONNECT".to_string()));
        }
        other => trace!(client_id = %conn.client_id, "ignoring packet {other:?}"),
    }

    Ok(true)
}
