//! # Payload Decoder
//!
//! Turns raw datagram/message bytes into a JSON tree.
//!
//! Decoding is all-or-nothing: the bytes must be valid UTF-8 and the whole text
//! must parse as a single JSON value. Anything else is a [`DecodeError`] and
//! the caller drops the packet.

use serde_json::Value;
use thiserror::Error;

/// Why a payload could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes are not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Text is not a single well-formed JSON value
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Successfully decoded payload
///
/// Keeps the exact text alongside the tree so the raw sink can republish it
/// unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    text: String,
    tree: Value,
}

impl DecodedPayload {
    /// The decoded text, byte-for-byte as received
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The parsed JSON tree
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Device serial reported in the top-level `gateway` field
    ///
    /// Numeric serials are rendered as text. Returns `None` when the field is
    /// absent, empty, or not a scalar.
    pub fn serial(&self) -> Option<String> {
        match self.tree.get("gateway")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Decode raw bytes into a [`DecodedPayload`]
///
/// # Errors
///
/// - [`DecodeError::InvalidUtf8`] if the bytes are not UTF-8
/// - [`DecodeError::Malformed`] if the text is not exactly one JSON value
///
/// # Examples
///
/// ```
/// use osd_bridge::decode::decode;
///
/// let payload = decode(br#"{"gateway":"SN1","data":{}}"#).unwrap();
/// assert_eq!(payload.serial().as_deref(), Some("SN1"));
///
/// assert!(decode(&[0xFF, 0xFE]).is_err());
/// assert!(decode(b"{\"gateway\":").is_err());
/// ```
pub fn decode(bytes: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let tree: Value = serde_json::from_str(text)?;

    Ok(DecodedPayload {
        text: text.to_owned(),
        tree,
    })
}
