// src/io/codec.rs
//
// MQTT wire codec for CAN frames.
//
// Topic: {base_topic}/{arbitration id in decimal}
// Body:  timestamp_us (8 bytes, little endian) + flags (1) + payload (0-64)
//
// Flags byte:
//   bit 0 - extended (29-bit) identifier
//   bit 1 - remote frame
//   bit 2 - CAN FD frame
//   bit 3 - error state indicator
//   bits 4-7 reserved, always written as zero

use super::{CanFrame, DecodeError, CAN_EFF_MASK, FD_MAX_LEN};

/// Wire constants
pub mod consts {
    /// Timestamp field size
    pub const TIMESTAMP_SIZE: usize = 8;
    /// Timestamp + flags
    pub const HEADER_SIZE: usize = 9;
    pub const FLAG_EXTENDED: u8 = 0x01;
    pub const FLAG_REMOTE: u8 = 0x02;
    pub const FLAG_FD: u8 = 0x04;
    pub const FLAG_ESI: u8 = 0x08;
    /// Bits that carry meaning; the rest are reserved
    pub const FLAG_MASK: u8 = 0x0F;
}

/// A CAN frame as it travels over MQTT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeMessage {
    pub topic: String,
    pub body: Vec<u8>,
}

/// Stateless translation between [`CanFrame`] and [`BridgeMessage`].
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame for publishing under `base_topic`.
    pub fn encode(frame: &CanFrame, base_topic: &str) -> BridgeMessage {
        let mut body = Vec::with_capacity(consts::HEADER_SIZE + frame.payload.len());
        body.extend_from_slice(&frame.timestamp_us.to_le_bytes());
        body.push(Self::flags(frame));
        body.extend_from_slice(&frame.payload);

        BridgeMessage {
            topic: Self::topic(base_topic, frame.arbitration_id),
            body,
        }
    }

    /// Decode a message received on `{base}/{id}`.
    ///
    /// Reserved flag bits are ignored.
    pub fn decode(topic: &str, body: &[u8]) -> Result<CanFrame, DecodeError> {
        if body.len() < consts::HEADER_SIZE || body.len() > consts::HEADER_SIZE + FD_MAX_LEN {
            return Err(DecodeError::MalformedBody { len: body.len() });
        }

        let arbitration_id = Self::parse_topic_id(topic)?;

        let mut stamp = [0u8; consts::TIMESTAMP_SIZE];
        stamp.copy_from_slice(&body[..consts::TIMESTAMP_SIZE]);
        let flags = body[consts::TIMESTAMP_SIZE];

        Ok(CanFrame {
            arbitration_id,
            timestamp_us: u64::from_le_bytes(stamp),
            is_extended: flags & consts::FLAG_EXTENDED != 0,
            is_remote: flags & consts::FLAG_REMOTE != 0,
            is_fd: flags & consts::FLAG_FD != 0,
            error_state_indicator: flags & consts::FLAG_ESI != 0,
            payload: body[consts::HEADER_SIZE..].to_vec(),
        })
    }

    /// Topic a frame with `arbitration_id` is published on.
    pub fn topic(base_topic: &str, arbitration_id: u32) -> String {
        format!("{}/{}", base_topic, arbitration_id)
    }

    /// Subscription filter matching every arbitration ID under `base_topic`.
    pub fn subscription(base_topic: &str) -> String {
        format!("{}/+", base_topic)
    }

    /// Flags byte for a frame.
    pub fn flags(frame: &CanFrame) -> u8 {
        let mut flags = 0u8;
        if frame.is_extended {
            flags |= consts::FLAG_EXTENDED;
        }
        if frame.is_remote {
            flags |= consts::FLAG_REMOTE;
        }
        if frame.is_fd {
            flags |= consts::FLAG_FD;
        }
        if frame.error_state_indicator {
            flags |= consts::FLAG_ESI;
        }
        flags
    }

    fn parse_topic_id(topic: &str) -> Result<u32, DecodeError> {
        let invalid = || DecodeError::InvalidTopic {
            topic: topic.to_string(),
        };

        let segment = topic.rsplit('/').next().unwrap_or(topic);
        if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        match segment.parse::<u32>() {
            Ok(id) if id <= CAN_EFF_MASK => Ok(id),
            _ => Err(invalid()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
