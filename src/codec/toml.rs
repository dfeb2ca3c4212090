//! TOML codec using the `toml` crate.

use serde::{de::DeserializeOwned, Serialize};

use super::Codec;
use crate::error::Result;

/// Codec speaking TOML. Bodies are UTF-8 documents; mostly useful for
/// configuration-shaped payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlCodec;

impl Codec for TomlCodec {
    fn name(&self) -> &'static str {
        "TOML"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(toml::to_string(value)?.into_bytes())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| crate::error::Error::Protocol(format!("TOML body is not UTF-8: {e}")))?;
        Ok(toml::from_str(s)?)
    }
}
