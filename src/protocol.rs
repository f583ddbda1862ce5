//! Binary wire protocol for the collaboration transport.
//!
//! Wire format for one watch frame:
//! ```text
//! ┌────────────┬────────────┬──────────────────────────────┐
//! │ offset     │ size       │ payload (inline mode only)   │
//! │ i32 LE     │ i32 LE     │ `size` bytes, re-read at     │
//! │            │            │ delivery time                │
//! └────────────┴────────────┴──────────────────────────────┘
//! ```
//!
//! The greeting response opens with a two-byte header:
//! protocol version, then an "initialization needed" boolean byte.

use serde::{Deserialize, Serialize};

/// Version byte sent in the greeting header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of one `(offset, size)` event frame on the wire.
pub const EVENT_FRAME_LEN: usize = 8;

/// A completed write, described as the byte range that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub offset: i32,
    pub size: i32,
}

impl UpdateEvent {
    pub fn new(offset: i32, size: i32) -> Self {
        Self { offset, size }
    }

    /// Serialize to the fixed-width little-endian wire frame.
    pub fn encode(&self) -> [u8; EVENT_FRAME_LEN] {
        let mut frame = [0u8; EVENT_FRAME_LEN];
        frame[..4].copy_from_slice(&self.offset.to_le_bytes());
        frame[4..].copy_from_slice(&self.size.to_le_bytes());
        frame
    }

    /// Deserialize from a wire frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < EVENT_FRAME_LEN {
            return Err(ProtocolError::ShortFrame {
                expected: EVENT_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        let offset = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let size = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { offset, size })
    }
}

/// Build the two-byte greeting header.
pub fn greeting_header(init_needed: bool) -> [u8; 2] {
    [PROTOCOL_VERSION, init_needed as u8]
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed event frame length.
    ShortFrame { expected: usize, actual: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortFrame { expected, actual } => {
                write!(f, "short event frame: expected {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_roundtrip() {
        let event = UpdateEvent::new(100, 4);
        let frame = event.encode();
        assert_eq!(frame.len(), EVENT_FRAME_LEN);

        let decoded = UpdateEvent::decode(&frame).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_frame_little_endian() {
        let event = UpdateEvent::new(0x0102_0304, 0x0A0B_0C0D);
        let frame = event.encode();
        assert_eq!(frame[..4], [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(frame[4..], [0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn test_decode_short_frame() {
        let err = UpdateEvent::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ShortFrame {
                expected: EVENT_FRAME_LEN,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = UpdateEvent::new(7, 9).encode().to_vec();
        bytes.extend_from_slice(&[0xFF; 16]);
        let decoded = UpdateEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, UpdateEvent::new(7, 9));
    }

    #[test]
    fn test_greeting_header() {
        assert_eq!(greeting_header(true), [PROTOCOL_VERSION, 1]);
        assert_eq!(greeting_header(false), [PROTOCOL_VERSION, 0]);
    }
}
