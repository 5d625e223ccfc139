//! Reversible encodings for values that end up in tag indexes.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Encodes a URL so it can be stored as a single tag token.
pub fn encode_url(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Inverse of [`encode_url`]. Padded input is accepted.
pub fn decode_url(encoded: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .with_context(|| format!("invalid encoded url: {}", encoded))?;
    String::from_utf8(bytes).context("encoded url is not utf-8")
}

/// Serde adapter that keeps URLs decoded in memory and encoded at rest.
pub mod url_b64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(url: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_url(url))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::decode_url(&encoded).map_err(D::Error::custom)
    }
}
