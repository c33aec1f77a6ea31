//! The `client` module holds the gateway's own connection to the bus.
//!
//! `BusClient` is the single long-lived subscriber shared by every WebSocket
//! session. Whatever it receives lands in the `LastMessageSlot`, which the
//! sessions read when they answer a topic request.

pub mod bus_client;
pub mod slot;

pub use bus_client::{BusClient, DeliveryCallback, TopicSubscriber};
pub use slot::{BusMessage, LastMessageSlot, MessageSlot};
