//! Broker Lifecycle Manager
//!
//! Owns the embedded broker end to end:
//! `Uninitialized -> Starting -> Running -> Stopping -> Stopped`.
//! A stopped instance is never restarted; build a new one instead.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpSocket, lookup_host};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::engine::BrokerHandle;
use crate::broker::hooks::{BrokerHooks, HookDispatcher};
use crate::broker::listener::{self, ListenerContext};
use crate::broker::message::Message;
use crate::config::BrokerSettings;
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Starting => "starting",
            BrokerState::Running => "running",
            BrokerState::Stopping => "stopping",
            BrokerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct BrokerLifecycle {
    broker: Arc<BrokerHandle>,
    state: Mutex<BrokerState>,
    running: Mutex<Option<Running>>,
}

impl BrokerLifecycle {
    pub fn new(hooks: Arc<dyn BrokerHooks>) -> Self {
        Self {
            broker: Arc::new(BrokerHandle::new(HookDispatcher::new(hooks))),
            state: Mutex::new(BrokerState::Uninitialized),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn broker(&self) -> &Arc<BrokerHandle> {
        &self.broker
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.local_addr)
    }

    /// Moves `from -> to` atomically, or reports the state found instead.
    fn transition(&self, from: BrokerState, to: BrokerState) -> Result<(), BrokerState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(*state);
        }
        debug!(%from, %to, "broker state transition");
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: BrokerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    /// Binds the listener and starts accepting bus clients.
    ///
    /// A bind failure leaves the instance `Stopped`.
    pub async fn start(&self, settings: &BrokerSettings) -> Result<SocketAddr, BrokerError> {
        self.transition(BrokerState::Uninitialized, BrokerState::Starting)
            .map_err(|state| BrokerError::AlreadyStarted(state.to_string()))?;

        let (listener, local_addr) = match bind(settings).await {
            Ok(bound) => bound,
            Err(e) => {
                self.set_state(BrokerState::Stopped);
                return Err(e);
            }
        };

        let ctx = ListenerContext::new(
            self.broker.clone(),
            settings.timeout(),
            settings.max_connections,
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener::serve(listener, ctx, shutdown.clone()));

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            shutdown,
            task,
            local_addr,
        });

        self.set_state(BrokerState::Running);
        self.broker.hooks().started(&local_addr.to_string());
        info!(%local_addr, backlog = settings.max_connections, "mqtt listener bound");
        Ok(local_addr)
    }

    /// Stops accepting clients, closes every connection and waits for the
    /// listener to wind down.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        self.transition(BrokerState::Running, BrokerState::Stopping)
            .map_err(|state| BrokerError::NotRunning(state.to_string()))?;

        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut result = Ok(());
        if let Some(running) = running {
            running.shutdown.cancel();
            self.broker.disconnect_all();
            if let Err(e) = running.task.await {
                result = Err(BrokerError::Task(e.to_string()));
            }
        }

        self.set_state(BrokerState::Stopped);
        self.broker.hooks().stopped();
        result
    }

    /// Routes `message` as if it had been published over the wire.
    ///
    /// Returns the number of receivers; fails unless the broker is running.
    pub fn inject(&self, message: &Message) -> Result<usize, BrokerError> {
        let state = self.state();
        if state != BrokerState::Running {
            return Err(BrokerError::NotRunning(state.to_string()));
        }
        Ok(self.broker.publish(message))
    }
}

impl fmt::Debug for BrokerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerLifecycle")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Binds with the configured backlog.
async fn bind(
    settings: &BrokerSettings,
) -> Result<(tokio::net::TcpListener, SocketAddr), BrokerError> {
    let addr = settings.bind_address();
    let bind_err = |source| BrokerError::Bind {
        addr: addr.clone(),
        source,
    };

    let resolved = lookup_host(addr.as_str())
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| BrokerError::InvalidAddress(addr.clone()))?;

    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(resolved).map_err(bind_err)?;

    let backlog = u32::try_from(settings.max_connections.max(1)).unwrap_or(u32::MAX);
    let listener = socket.listen(backlog).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;
    Ok((listener, local_addr))
}
