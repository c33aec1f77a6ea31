//! The `error` module defines the error types used across the gateway.
//!
//! Each component owns one enum so callers can tell a broker start failure
//! from a bus subscription failure without string matching. `AppError` is the
//! top-level type returned by the binary.

use std::io;

use thiserror::Error;

/// Errors raised by the Broker Lifecycle Manager.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker already started (state: {0})")]
    AlreadyStarted(String),

    #[error("broker is not running (state: {0})")]
    NotRunning(String),

    #[error("failed to bind broker listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid broker address `{0}`")]
    InvalidAddress(String),

    #[error("broker listener task failed: {0}")]
    Task(String),
}

/// Errors raised by the Bus Client Adapter.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to bus at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("bus client request failed: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("subscription to `{0}` was refused by the bus")]
    Rejected(String),

    #[error("timed out waiting for the bus to acknowledge `{0}`")]
    Timeout(String),

    #[error("bus connection is closed")]
    Closed,
}

/// Errors returned by the Publish Gateway.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot publish to `{topic}`: {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("invalid topic name `{0}`")]
    InvalidTopic(String),
}

/// Errors that end a single WebSocket session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("failed to serialize response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bus subscription failed: {0}")]
    Subscribe(#[from] BusError),
}

/// Top-level error for the `mqttsocket` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to bind http listener on {addr}: {source}")]
    HttpBind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
