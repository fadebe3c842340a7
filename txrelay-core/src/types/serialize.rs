//! Hex helpers shared by the socket protocol and JSON records.

use serde::{de, Deserialize, Deserializer, Serializer};

/// Decode a hex string, accepting an optional `0x` prefix and surrounding
/// whitespace.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(stripped)
}

/// Encode bytes as a `0x` prefixed lowercase hex string.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// serde adapter storing a byte vector as `0x` hex.
pub mod hex_bytes {
    use super::*;

    /// Serialize bytes as a prefixed hex string
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(bytes))
    }

    /// Deserialize bytes from a hex string with or without prefix
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode_hex(&s).map_err(de::Error::custom)
    }
}
