//! Bus Client Adapter
//!
//! One `rumqttc` connection to the bus, opened at startup and shared by all
//! WebSocket sessions:
//! - `connect` blocks until the bus has accepted the connection
//! - a background task drives the event loop and hands every inbound PUBLISH
//!   to the delivery callback
//! - `subscribe` waits for the SUBACK of the filter it sent
//!
//! The adapter does not reconnect. When the event loop fails the task logs it
//! and stops, and sessions simply stop seeing new data.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusClientSettings;
use crate::utils::error::BusError;

/// Invoked once per inbound application message with `(topic, payload)`.
pub type DeliveryCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync + 'static>;

/// Anything a session can ask to subscribe to a topic filter.
#[async_trait]
pub trait TopicSubscriber: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError>;
}

type AckSender = oneshot::Sender<Result<(), BusError>>;

/// Matches SUBSCRIBE requests to their SUBACKs.
///
/// Requests are queued in send order; the event loop reports the packet id
/// of each SUBSCRIBE as it goes out, in the same order.
#[derive(Default)]
struct PendingAcks {
    queued: VecDeque<(String, AckSender)>,
    in_flight: HashMap<u16, (String, AckSender)>,
    closed: bool,
}

impl PendingAcks {
    fn sent(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                self.in_flight.insert(pkid, waiter);
            }
            None => debug!(pkid, "subscribe sent with no waiter"),
        }
    }

    fn acknowledged(&mut self, ack: SubAck) {
        let Some((filter, waiter)) = self.in_flight.remove(&ack.pkid) else {
            debug!(pkid = ack.pkid, "unexpected SUBACK");
            return;
        };

        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if refused {
            Err(BusError::Rejected(filter))
        } else {
            Ok(())
        };
        let _ = waiter.send(result);
    }

    /// Fails every waiter; later requests fail immediately.
    fn close(&mut self) {
        self.closed = true;
        for (_, waiter) in self.queued.drain(..) {
            let _ = waiter.send(Err(BusError::Closed));
        }
        for (_, (_, waiter)) in self.in_flight.drain() {
            let _ = waiter.send(Err(BusError::Closed));
        }
    }
}

#[derive(Default)]
struct Shared {
    acks: Mutex<PendingAcks>,
    subscriptions: Mutex<Vec<String>>,
}

impl Shared {
    fn acks(&self) -> MutexGuard<'_, PendingAcks> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The gateway's subscriber connection to the bus.
pub struct BusClient {
    client: AsyncClient,
    shared: Arc<Shared>,
    /// Keeps queueing and sending one SUBSCRIBE atomic.
    request_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Connects to the bus and starts delivering messages to `callback`.
    ///
    /// Returns once the bus has acknowledged the connection. There is no
    /// retry: a refused or unreachable bus is reported as `BusError::Connect`.
    pub async fn connect(
        settings: &BusClientSettings,
        callback: DeliveryCallback,
    ) -> Result<Self, BusError> {
        let addr = settings.address();
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);

        let connected = timeout(settings.timeout(), wait_for_connack(&mut eventloop)).await;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(BusError::Connect { addr, reason }),
            Err(_) => {
                return Err(BusError::Connect {
                    addr,
                    reason: "no CONNACK within timeout".to_string(),
                });
            }
        }
        info!(%addr, client_id = %settings.client_id, "connected to bus");

        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(drive(
            eventloop,
            callback,
            shared.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            shared,
            request_lock: tokio::sync::Mutex::new(()),
            ack_timeout: settings.timeout(),
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Subscribes to `filter` at QoS 1 and waits for the bus to grant it.
    ///
    /// Subscribing again to a filter already held succeeds.
    pub async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let ack = {
            let _guard = self.request_lock.lock().await;

            let (tx, rx) = oneshot::channel();
            {
                let mut acks = self.shared.acks();
                if acks.closed {
                    return Err(BusError::Closed);
                }
                acks.queued.push_back((filter.to_string(), tx));
            }

            if let Err(e) = self.client.subscribe(filter, QoS::AtLeastOnce).await {
                self.shared.acks().queued.pop_back();
                return Err(e.into());
            }
            rx
        };

        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                debug!(filter, "subscription granted");
                self.shared
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(filter.to_string());
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(filter.to_string())),
        }
    }

    /// Every filter granted so far, duplicates included. Sessions never
    /// unsubscribe, so this only grows.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the event loop task is still delivering.
    pub fn is_connected(&self) -> bool {
        !self.shared.acks().closed
    }

    /// Sends DISCONNECT and stops the event loop task.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("bus disconnect request not sent: {e}");
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return;
        };

        if timeout(self.ack_timeout, &mut task).await.is_err() {
            self.shutdown.cancel();
            let _ = task.await;
        }
        info!("bus client disconnected");
    }
}

#[async_trait]
impl TopicSubscriber for BusClient {
    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        BusClient::subscribe(self, filter).await
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(format!("connection refused: {code:?}")),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Delivery task. Ends on shutdown, on an outgoing DISCONNECT or on the
/// first connection error.
async fn drive(
    mut eventloop: EventLoop,
    callback: DeliveryCallback,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                callback(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.acks().acknowledged(ack),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.acks().sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("bus connection lost, no further messages will be delivered: {e}");
                break;
            }
        }
    }

    shared.acks().close();
    debug!("bus event loop stopped");
}
