//! The `utils` module provides shared building blocks used across the
//! `mqttsocket` application: the error taxonomy and the logging bootstrap.

pub mod error;
pub mod logging;
