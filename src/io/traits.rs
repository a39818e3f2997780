// src/io/traits.rs
//
// Channel abstractions the bridge loop is written against. Both channels are
// owned exclusively by the loop, so methods take `&mut self`.

use async_trait::async_trait;
use std::time::Duration;

use super::{BridgeError, CanFrame};

/// A CAN adapter.
#[async_trait]
pub trait BusChannel: Send {
    /// Device label used in logs and errors, e.g. `socketcan(can0)`.
    fn name(&self) -> &str;

    /// Take the next buffered frame without waiting.
    ///
    /// `Ok(None)` means nothing is buffered right now. Adapters that read on a
    /// worker also report its failures here: a failed read means the adapter
    /// is gone (fatal), a failed transmit of an earlier `send` is not.
    fn try_receive(&mut self) -> Result<Option<CanFrame>, BridgeError>;

    /// Queue a frame for transmission on the bus.
    fn send(&mut self, frame: &CanFrame) -> Result<(), BridgeError>;

    /// Stop the adapter and release the interface.
    async fn close(&mut self);
}

/// A message received from the broker on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// An MQTT client connection.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Subscribe at QoS 0. Subscriptions are renewed after reconnects.
    fn subscribe(&mut self, topic_filter: &str) -> Result<(), BridgeError>;

    /// Fire-and-forget publish at QoS 0.
    fn publish(&mut self, topic: &str, body: Vec<u8>) -> Result<(), BridgeError>;

    /// Service the connection for at most `max_wait`, returning inbound
    /// messages in arrival order.
    async fn pump(&mut self, max_wait: Duration) -> Vec<InboundMessage>;

    /// Flush queued publishes and disconnect, giving up after `timeout`.
    async fn shutdown(&mut self, timeout: Duration);
}
