//! Error types for pipelink.

use thiserror::Error;

/// Main error type for all pipelink operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed payload that is not tied to a specific codec.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame header announced a payload above the configured limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced payload size.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Rendezvous exchange failed (peer vanished, bad name, transport error).
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Push attempted with no active connection.
    #[error("Not connected")]
    NotConnected,

    /// `push_to` found no connection with the given display name.
    #[error("No connection named {0:?}")]
    UnknownConnection(String),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(&'static str),
}

impl IpcError {
    /// True for errors raised while turning bytes back into a message.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            IpcError::Decode(_)
                | IpcError::MsgPackDecode(_)
                | IpcError::Json(_)
                | IpcError::FrameTooLarge { .. }
        )
    }
}

/// Result type alias using IpcError.
pub type Result<T> = std::result::Result<T, IpcError>;
