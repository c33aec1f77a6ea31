//! The `transport` module is responsible for handling network communication
//! with browsers.
//!
//! It defines the JSON frames exchanged over WebSockets, the per-connection
//! session loop that turns topic requests into bus subscriptions, and the HTTP
//! surface (`/ws`, `/a`, `/m/{topic}/{data}`) hosting them.

pub mod http;
pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod websocket_tests;
