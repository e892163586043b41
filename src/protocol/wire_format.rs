//! Wire format encoding and decoding.
//!
//! ```text
//! ┌──────────────┬─────────────────────┐
//! │ Length       │ Payload             │
//! │ 4 bytes      │ Length bytes        │
//! │ uint32 BE    │ codec output        │
//! └──────────────┴─────────────────────┘
//! ```

use crate::error::{IpcError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Header for a payload, rejecting payloads that do not fit the length field.
    pub fn for_payload(payload: &[u8]) -> Result<Self> {
        let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
            size: u32::MAX,
            max: u32::MAX,
        })?;
        Ok(Self::new(len))
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use pipelink::protocol::Header;
    ///
    /// assert_eq!(Header::new(258).encode(), [0, 0, 1, 2]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.payload_length.to_be_bytes()
    }

    /// Decode header from bytes (Big Endian).
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self::new(u32::from_be_bytes(*buf))
    }

    /// Reject headers announcing more than `max_payload_size` bytes.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(IpcError::FrameTooLarge {
                size: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_big_endian() {
        let header = Header::decode(&[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(header.payload_length, 65536);
        assert_eq!(Header::decode(&header.encode()), header);
    }

    #[test]
    fn test_validate_limit() {
        assert!(Header::new(10).validate(10).is_ok());
        let err = Header::new(11).validate(10).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { size: 11, max: 10 }));
    }
}
