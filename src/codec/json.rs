//! JSON codec using `serde_json`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// JSON codec, one compact document per frame.
pub struct JsonCodec;

impl Codec for JsonCodec {
    #[inline]
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_compact_json() {
        let encoded = JsonCodec::encode(&vec!["chat_1", "chat_2"]).unwrap();
        assert_eq!(encoded, br#"["chat_1","chat_2"]"#);
    }

    #[test]
    fn test_decode_error_is_decode_class() {
        let result: Result<Vec<String>> = JsonCodec::decode(b"{oops");
        assert!(result.unwrap_err().is_decode());
    }
}
