// src/io/mod.rs
//
// Wire-facing side of the bridge: the CAN frame model, the MQTT frame codec,
// and the two channel abstractions (CAN bus and MQTT broker) with their
// concrete adapters.

// Core modules
pub mod codec; // CAN frame <-> MQTT topic/body
mod error;
pub mod traits; // BusChannel / BrokerChannel

// Bus adapters
pub mod loopback;
pub mod socketcan;

// Broker adapter
pub mod mqtt;

pub use codec::{BridgeMessage, FrameCodec};
pub use error::{BridgeError, DecodeError};
pub use loopback::{LoopbackBus, LoopbackHandle};
pub use mqtt::MqttBroker;
pub use socketcan::SocketCanBus;
pub use traits::{BrokerChannel, BusChannel, InboundMessage};

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::settings::BusConfig;

// ============================================================================
// Frame Model
// ============================================================================

/// Largest standard (11-bit) identifier.
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Largest extended (29-bit) identifier.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit.
pub const CLASSIC_MAX_LEN: usize = 8;
/// CAN FD payload limit.
pub const FD_MAX_LEN: usize = 64;

/// One CAN bus message at the moment of capture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CanFrame {
    /// 11-bit standard or 29-bit extended identifier
    pub arbitration_id: u32,
    /// Capture time in microseconds (host UNIX time for live adapters)
    pub timestamp_us: u64,
    pub is_extended: bool,
    pub is_remote: bool,
    pub is_fd: bool,
    /// CAN FD error state indicator
    pub error_state_indicator: bool,
    /// 0-8 bytes for classic CAN, up to 64 for CAN FD
    pub payload: Vec<u8>,
}

impl CanFrame {
    /// Classic data frame stamped with the current host time.
    pub fn new(arbitration_id: u32, payload: &[u8]) -> Self {
        Self {
            arbitration_id,
            timestamp_us: now_us(),
            is_extended: arbitration_id > CAN_SFF_MASK,
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    /// Check that the frame can be put on a bus as-is.
    pub fn validate(&self) -> Result<(), String> {
        let id_mask = if self.is_extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if self.arbitration_id > id_mask {
            return Err(format!(
                "id 0x{:X} does not fit a {} identifier",
                self.arbitration_id,
                if self.is_extended { "29-bit" } else { "11-bit" }
            ));
        }

        let max_len = if self.is_fd { FD_MAX_LEN } else { CLASSIC_MAX_LEN };
        if self.payload.len() > max_len {
            return Err(format!(
                "payload too long: {} bytes (max {})",
                self.payload.len(),
                max_len
            ));
        }

        if self.is_remote && self.is_fd {
            return Err("CAN FD has no remote frames".to_string());
        }
        if self.is_remote && !self.payload.is_empty() {
            return Err("remote frame cannot carry a payload".to_string());
        }
        if self.error_state_indicator && !self.is_fd {
            return Err("error state indicator is only valid on CAN FD frames".to_string());
        }

        Ok(())
    }
}

/// Host UNIX time in microseconds.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Bus Selection
// ============================================================================

/// Bus adapter selected by `bus.bus_type`.
pub enum AnyBus {
    SocketCan(SocketCanBus),
    Virtual(LoopbackBus),
}

/// Open the bus adapter named in the configuration.
pub fn open_bus(config: &BusConfig) -> Result<AnyBus, BridgeError> {
    match config.bus_type.as_str() {
        "socketcan" => SocketCanBus::open(config).map(AnyBus::SocketCan),
        "virtual" => Ok(AnyBus::Virtual(LoopbackBus::new(
            &config.channel,
            config.queue_capacity,
        ))),
        other => Err(BridgeError::adapter_open(
            &format!("{}({})", other, config.channel),
            format!("unsupported bus type '{}' (expected socketcan or virtual)", other),
        )),
    }
}

#[async_trait]
impl BusChannel for AnyBus {
    fn name(&self) -> &str {
        match self {
            Self::SocketCan(bus) => bus.name(),
            Self::Virtual(bus) => bus.name(),
        }
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, BridgeError> {
        match self {
            Self::SocketCan(bus) => bus.try_receive(),
            Self::Virtual(bus) => bus.try_receive(),
        }
    }


    fn send(&mut self, frame: &CanFrame) -> Result<(), BridgeError> {
        match self {
            Self::SocketCan(bus) => bus.send(frame),
            Self::Virtual(bus) => bus.send(frame),
        }
    }

    async fn close(&mut self) {
        match self {
            Self::SocketCan(bus) => bus.close().await,
            Self::Virtual(bus) => bus.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_frame(len: usize) -> CanFrame {
        CanFrame {
            arbitration_id: 0x18FF_0001,
            is_extended: true,
            is_fd: true,
            payload: vec![0x55; len],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_picks_id_format() {
        assert!(!CanFrame::new(0x7FF, &[]).is_extended);
        assert!(CanFrame::new(0x800, &[]).is_extended);
    }

    #[test]
    fn test_validate_id_range() {
        let mut frame = CanFrame::new(0x123, &[1, 2, 3]);
        assert!(frame.validate().is_ok());

        frame.arbitration_id = 0x800;
        assert!(frame.validate().unwrap_err().contains("11-bit"));

        frame.is_extended = true;
        assert!(frame.validate().is_ok());

        frame.arbitration_id = CAN_EFF_MASK + 1;
        assert!(frame.validate().unwrap_err().contains("29-bit"));
    }

    #[test]
    fn test_validate_payload_length() {
        assert!(CanFrame::new(0x10, &[0; 8]).validate().is_ok());
        assert!(CanFrame::new(0x10, &[0; 9]).validate().is_err());
        assert!(fd_frame(64).validate().is_ok());
        assert!(fd_frame(65).validate().is_err());
    }

    #[test]
    fn test_validate_remote_and_esi() {
        let mut remote = CanFrame::new(0x10, &[]);
        remote.is_remote = true;
        assert!(remote.validate().is_ok());

        remote.payload = vec![1];
        assert!(remote.validate().is_err());

        let mut classic = CanFrame::new(0x10, &[]);
        classic.error_state_indicator = true;
        assert!(classic.validate().is_err());

        let mut fd = fd_frame(12);
        fd.error_state_indicator = true;
        assert!(fd.validate().is_ok());
    }

    #[test]
    fn test_open_bus_rejects_unknown_type() {
        let config = BusConfig {
            bus_type: "pcan".to_string(),
            ..BusConfig::default()
        };
        match open_bus(&config) {
            Err(BridgeError::AdapterOpen { device, message }) => {
                assert_eq!(device, "pcan(can0)");
                assert!(message.contains("unsupported bus type"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected an open failure"),
        }
    }

    #[tokio::test]
    async fn test_open_virtual_bus() {
        let config = BusConfig {
            bus_type: "virtual".to_string(),
            channel: "vcan0".to_string(),
            ..BusConfig::default()
        };
        let mut bus = open_bus(&config).unwrap();
        assert_eq!(bus.name(), "virtual(vcan0)");

        let frame = CanFrame::new(0x42, &[1, 2]);
        bus.send(&frame).unwrap();
        assert_eq!(bus.try_receive().unwrap(), Some(frame));
        bus.close().await;
    }
}
