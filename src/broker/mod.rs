//! The embedded bus broker.
//!
//! - `engine`: routing table, retained store and the shared `BrokerHandle`.
//! - `topic`: MQTT topic name / filter rules.
//! - `listener`: MQTT 3.1.1 over TCP.
//! - `lifecycle`: start/stop state machine and message injection.
//! - `hooks`: lifecycle and audit callbacks.
//! - `gateway`: the internal publisher used by the HTTP trigger.

pub mod client;
pub mod engine;
pub mod gateway;
pub mod hooks;
pub mod lifecycle;
pub mod listener;
pub mod message;
pub mod topic;

pub use engine::{Broker, BrokerHandle};
pub use gateway::PublishGateway;
pub use hooks::{BrokerHooks, LoggingHooks, NoopHooks};
pub use lifecycle::{BrokerLifecycle, BrokerState};
pub use message::{INTERNAL_SENDER_ID, Message};
