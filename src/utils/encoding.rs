//! Base64URL helpers used at the transport boundary
//!
//! Browsers send `ArrayBuffer` fields as base64url without padding, but
//! older kiosk pages used plain `btoa`, so decoding accepts both alphabets
//! and tolerates padding.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

/// Encode bytes as unpadded base64url
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url or standard base64, padded or not
///
/// # Errors
///
/// Returns an error if the text is valid in neither alphabet
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = text.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
}

/// Serde adapter storing `Vec<u8>` fields as base64url strings
pub mod base64url {
    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    ///
    /// Propagates serializer errors
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    /// # Errors
    ///
    /// Returns an error if the string is not valid base64
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::decode(&text).map_err(serde::de::Error::custom)
    }
}
