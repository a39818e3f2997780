// src/io/mqtt/mod.rs
//
// MQTT broker channel over rumqttc, optionally TLS-secured.

mod client;
#[cfg(test)]
pub(crate) mod test_broker;

// Re-export public items
pub use client::{mqtt_options, MqttBroker};
