//! JSON codec using `serde_json`.

use serde::{de::DeserializeOwned, Serialize};

use super::Codec;
use crate::error::Result;

/// Codec speaking JSON. The default choice for debuggability: bodies stay
/// readable in a pipe dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "JSON"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
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
        let encoded = JsonCodec.encode(&original).unwrap();
        let decoded: Payload = JsonCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_is_plain_json() {
        let encoded = JsonCodec
            .encode(&Payload {
                id: 1,
                text: "x".to_string(),
            })
            .unwrap();
        assert_eq!(encoded, br#"{"id":1,"text":"x"}"#);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Payload> = JsonCodec.decode(b"not json");
        assert!(result.is_err());
    }
}
