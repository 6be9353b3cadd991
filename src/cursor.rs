//! Opaque pagination cursor binding a page offset to the catalog generation
//! it was computed against.
//!
//! Encoded as `base64(json({offset, checksum}))`. `checksum` is the
//! registry's mutation counter ([`crate::registry::ToolRegistry::generation`])
//! at the time the page was produced; decoding a cursor against a registry
//! whose generation has since moved on is treated as stale input rather than
//! silently returning a shifted page.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::errors::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub offset: usize,
    pub checksum: u64,
}

impl Cursor {
    pub fn new(offset: usize, checksum: u64) -> Self {
        Self { offset, checksum }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("Cursor always serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode and validate a cursor string.
    ///
    /// Rejects malformed base64/JSON and negative offsets (not representable
    /// in `usize`, but a negative number in the JSON source is still
    /// explicitly rejected rather than failing opaquely at deserialize time).
    pub fn decode(raw: &str) -> Result<Self, ToolError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| ToolError::validation_input(format!("invalid cursor encoding: {e}")))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ToolError::validation_input(format!("invalid cursor payload: {e}")))?;

        let offset = value
            .get("offset")
            .ok_or_else(|| ToolError::validation_input("cursor missing 'offset'"))?;
        if offset.as_i64().is_none_or(|o| o < 0) {
            return Err(ToolError::validation_input(
                "cursor 'offset' must be a non-negative integer",
            ));
        }
        let checksum = value
            .get("checksum")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| ToolError::validation_input("cursor missing 'checksum'"))?;
        let offset = offset.as_u64().unwrap() as usize;

        Ok(Cursor { offset, checksum })
    }

    /// Decode a cursor and verify it is bound to the given generation.
    pub fn decode_checked(raw: &str, expected_generation: u64) -> Result<Self, ToolError> {
        let cursor = Self::decode(raw)?;
        if cursor.checksum != expected_generation {
            return Err(ToolError::validation_input(
                "cursor is stale: the catalog has changed since this cursor was issued",
            ));
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let c = Cursor::new(40, 7);
        let encoded = c.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(c, decoded);
    }

    #[test]
    fn test_decode_checked_rejects_stale() {
        let c = Cursor::new(0, 1);
        let encoded = c.encode();
        let err = Cursor::decode_checked(&encoded, 2).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ValidationInput);
    }

    #[test]
    fn test_decode_checked_accepts_matching_generation() {
        let c = Cursor::new(10, 3);
        let encoded = c.encode();
        let decoded = Cursor::decode_checked(&encoded, 3).unwrap();
        assert_eq!(decoded.offset, 10);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Cursor::decode("not-valid-base64!!!").is_err());
    }

    #[test]
    fn test_decode_rejects_negative_offset() {
        let json = serde_json::json!({"offset": -1, "checksum": 0});
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json).unwrap());
        assert!(Cursor::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let encoded = URL_SAFE_NO_PAD.encode(b"{}");
        assert!(Cursor::decode(&encoded).is_err());
    }
}
