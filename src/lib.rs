//! # mqttsocket
//!
//! `mqttsocket` bridges browser WebSocket clients to an MQTT bus. The process
//! embeds a small MQTT broker, keeps one bus client subscribed on behalf of
//! every browser session, and relays the most recent bus delivery back as
//! JSON frames.
//!
//! ## Core Modules
//!
//! - `broker`: the embedded broker, its lifecycle manager, audit hooks and the
//!   publish gateway used by the HTTP trigger.
//! - `client`: the bus client adapter and the shared last-message slot.
//! - `config`: layered configuration (file, environment, defaults).
//! - `transport`: WebSocket session protocol and the HTTP surface.
//! - `utils`: error types and logging bootstrap.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
