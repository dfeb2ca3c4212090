//! MsgPack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps (with field names)
//! rather than positional arrays. That keeps bodies self-describing and
//! decodable by peers written against other MessagePack implementations.

use serde::{de::DeserializeOwned, Serialize};

use super::Codec;
use crate::error::Result;

/// Codec speaking MessagePack, the compact binary option.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "MSGPACK"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        id: u32,
        text: String,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Payload {
            id: 42,
            text: "hello".to_string(),
        };
        let encoded = MsgPackCodec.encode(&original).unwrap();
        let decoded: Payload = MsgPackCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_encode_as_maps() {
        let encoded = MsgPackCodec
            .encode(&Payload {
                id: 1,
                text: "x".to_string(),
            })
            .unwrap();
        // fixmap with 2 entries, not fixarray.
        assert_eq!(encoded[0], 0x82);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Payload> = MsgPackCodec.decode(b"not msgpack");
        assert!(result.is_err());
    }
}
