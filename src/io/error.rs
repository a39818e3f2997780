// src/io/error.rs
//
// Error kinds for the bus adapters, the broker channel and the wire codec.

use thiserror::Error;

/// Failure to turn an MQTT message back into a CAN frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Body shorter than the 9-byte header, or longer than header + 64 bytes.
    #[error("malformed body: {len} bytes (expected 9 to 73)")]
    MalformedBody { len: usize },
    /// Last topic segment is not a decimal arbitration ID.
    #[error("invalid topic '{topic}': last segment is not an arbitration id")]
    InvalidTopic { topic: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{device}: failed to open adapter: {message}")]
    AdapterOpen { device: String, message: String },

    #[error("{device}: read failed: {message}")]
    AdapterRead { device: String, message: String },

    #[error("{device}: write failed: {message}")]
    AdapterWrite { device: String, message: String },

    #[error("{endpoint}: connection failed: {message}")]
    BrokerConnect { endpoint: String, message: String },

    #[error("{endpoint}: publish to '{topic}' failed: {message}")]
    BrokerPublish {
        endpoint: String,
        topic: String,
        message: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn adapter_open(device: &str, message: impl Into<String>) -> Self {
        Self::AdapterOpen {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn adapter_read(device: &str, message: impl Into<String>) -> Self {
        Self::AdapterRead {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn adapter_write(device: &str, message: impl Into<String>) -> Self {
        Self::AdapterWrite {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn broker_connect(endpoint: &str, message: impl Into<String>) -> Self {
        Self::BrokerConnect {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn broker_publish(endpoint: &str, topic: &str, message: impl Into<String>) -> Self {
        Self::BrokerPublish {
            endpoint: endpoint.to_string(),
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Fatal errors terminate the bridge; everything else is reported and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AdapterOpen { .. }
                | Self::AdapterRead { .. }
                | Self::BrokerConnect { .. }
                | Self::Config(_)
                | Self::Io(_)
        )
    }
}
