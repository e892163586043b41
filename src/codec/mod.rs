//! Codec module - the boundary between typed messages and frame payloads.
//!
//! The transport never looks inside a payload. Everything it needs from the
//! message layer is the [`Codec`] contract:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (default)
//! - [`JsonCodec`] - JSON using `serde_json`, handy when a peer is a script
//!
//! # Design
//!
//! Codecs are marker structs with static methods, picked on the builders with
//! `.codec::<C>()`. No codec instance is ever stored; a connection keeps the
//! two monomorphized functions it needs, so `Connection<T>` does not carry the
//! codec in its type.
//!
//! # Example
//!
//! ```
//! use pipelink::codec::{Codec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serialize/deserialize contract for message payloads.
///
/// `decode` must fail with a decode-class [`IpcError`](crate::IpcError)
/// on malformed input; it is never handed an empty end-of-stream marker,
/// the framing layer reports that separately.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into payload bytes.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes into a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// Bound shared by every payload type carried over a connection.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The encode/decode pair of one codec, monomorphized for one payload type.
pub(crate) struct CodecFns<T> {
    pub(crate) encode: fn(&T) -> Result<Vec<u8>>,
    pub(crate) decode: fn(&[u8]) -> Result<T>,
}

impl<T: Message> CodecFns<T> {
    pub(crate) fn of<C: Codec>() -> Self {
        Self {
            encode: C::encode::<T>,
            decode: C::decode::<T>,
        }
    }
}

impl<T> Clone for CodecFns<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CodecFns<T> {}

impl<T> std::fmt::Debug for CodecFns<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodecFns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_fns_match_codec() {
        let msgpack = CodecFns::<String>::of::<MsgPackCodec>();
        let json = CodecFns::<String>::of::<JsonCodec>();

        let bytes = (json.encode)(&"chat_1".to_string()).unwrap();
        assert_eq!(bytes, b"\"chat_1\"");

        let bytes = (msgpack.encode)(&"chat_1".to_string()).unwrap();
        assert_eq!((msgpack.decode)(&bytes).unwrap(), "chat_1");
        assert!((json.decode)(&bytes).is_err());
    }
}
