//! UniFi Protect to MQTT bridge library.
//!
//! Polls a Protect controller, publishes device facts and the transitions
//! of detected objects, and forwards device commands received over MQTT.

pub mod bridge;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod mqtt;
pub mod protect;

#[cfg(test)]
pub(crate) mod testing;
