//! Protocol module - wire format and framing.
//!
//! Every message on a channel, including the rendezvous name, is one frame:
//! a 4-byte big-endian payload length followed by the codec bytes.
//!
//! - [`Header`] encode/decode/validate
//! - [`FrameReader`] reads exactly one frame or reports end-of-stream
//! - [`write_frame`] writes and flushes a single frame

mod reader;
mod wire_format;

pub use reader::{write_frame, FrameReader};
pub use wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
