//! Payload codecs: the pluggable conversion between typed values and frame
//! bodies.
//!
//! The transport never interprets body bytes; it only moves them. A codec
//! has a short symbolic name which the client exports to the server through
//! the [`ENV_CLIENT_CODEC`] environment variable so both ends agree on the
//! format without extra negotiation.
//!
//! Three codecs ship with the crate:
//!
//! - [`JsonCodec`] — JSON via `serde_json`
//! - [`TomlCodec`] — TOML via `toml`
//! - [`MsgPackCodec`] — MessagePack via `rmp-serde` (struct-as-map)
//!
//! [`AnyCodec`] wraps the three behind one value, so the server can pick a
//! codec at runtime from the environment.

mod json;
mod msgpack;
mod toml;

use serde::{de::DeserializeOwned, Serialize};

pub use self::json::JsonCodec;
pub use self::msgpack::MsgPackCodec;
pub use self::toml::TomlCodec;
use crate::error::{Error, Result};

/// Environment variable through which the client tells the server which
/// codec it speaks. The server consults it only when no codec was
/// configured statically.
pub const ENV_CLIENT_CODEC: &str = "EXECRPC_CLIENT_CODEC";

/// A two-way conversion between typed values and body bytes.
pub trait Codec: Send + Sync + 'static {
    /// Short symbolic name (e.g. `JSON`), used for the codec handshake.
    fn name(&self) -> &'static str;

    /// Encode a value into body bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode body bytes into a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// A codec selected at runtime, e.g. from [`ENV_CLIENT_CODEC`].
#[derive(Debug, Clone, Copy)]
pub enum AnyCodec {
    /// JSON via `serde_json`.
    Json(JsonCodec),
    /// TOML via `toml`.
    Toml(TomlCodec),
    /// MessagePack via `rmp-serde`.
    MsgPack(MsgPackCodec),
}

impl AnyCodec {
    /// Resolve a codec by its symbolic name, case-insensitively.
    pub fn for_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(AnyCodec::Json(JsonCodec)),
            "toml" => Ok(AnyCodec::Toml(TomlCodec)),
            "msgpack" => Ok(AnyCodec::MsgPack(MsgPackCodec)),
            _ => Err(Error::UnknownCodec(name.to_string())),
        }
    }

    /// Resolve the codec announced by the client via [`ENV_CLIENT_CODEC`].
    pub fn from_env() -> Result<Self> {
        let name = std::env::var(ENV_CLIENT_CODEC).unwrap_or_default();
        Self::for_name(&name).map_err(|_| {
            Error::Protocol(format!(
                "failed to resolve codec from env variable {ENV_CLIENT_CODEC} with value {name:?} \
                 (set by client); it can optionally be set in the server options"
            ))
        })
    }
}

impl Codec for AnyCodec {
    fn name(&self) -> &'static str {
        match self {
            AnyCodec::Json(c) => c.name(),
            AnyCodec::Toml(c) => c.name(),
            AnyCodec::MsgPack(c) => c.name(),
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            AnyCodec::Json(c) => c.encode(value),
            AnyCodec::Toml(c) => c.encode(value),
            AnyCodec::MsgPack(c) => c.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            AnyCodec::Json(c) => c.decode(bytes),
            AnyCodec::Toml(c) => c.decode(bytes),
            AnyCodec::MsgPack(c) => c.decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_name_is_case_insensitive() {
        assert_eq!(AnyCodec::for_name("json").unwrap().name(), "JSON");
        assert_eq!(AnyCodec::for_name("JSON").unwrap().name(), "JSON");
        assert_eq!(AnyCodec::for_name("Toml").unwrap().name(), "TOML");
        assert_eq!(AnyCodec::for_name("msgpack").unwrap().name(), "MSGPACK");
    }

    #[test]
    fn test_for_name_unknown() {
        let err = AnyCodec::for_name("xml").unwrap_err();
        assert!(matches!(err, Error::UnknownCodec(_)));
    }

    #[test]
    fn test_any_codec_roundtrip_matches_inner() {
        let value = vec!["a".to_string(), "b".to_string()];
        for codec in [
            AnyCodec::Json(JsonCodec),
            AnyCodec::MsgPack(MsgPackCodec),
        ] {
            let encoded = codec.encode(&value).unwrap();
            let decoded: Vec<String> = codec.decode(&encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }
}
