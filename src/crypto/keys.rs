use base64::Engine;
use std::fmt;
use thiserror::Error;

/// Length of a raw Curve25519 key as used by WireGuard
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key encoding: {0}")]
    Encoding(String),

    #[error("Invalid key length: expected {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// A WireGuard key (private, public or preshared).
///
/// Keys travel through configuration as standard base64. The raw bytes are
/// never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Decode a base64 key as found in a WireGuard `.conf` file
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Encoding(e.to_string()))?;

        let len = bytes.len();
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::Length(len))?;
        Ok(WgKey(raw))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WgKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    #[test]
    fn test_key_decode_encode() {
        let key = WgKey::from_base64(PRIVATE).unwrap();
        assert_eq!(key.as_bytes().len(), KEY_LEN);
        assert_eq!(key.to_base64(), PRIVATE);
    }

    #[test]
    fn test_key_rejects_bad_input() {
        assert!(matches!(
            WgKey::from_base64("not base64!"),
            Err(KeyError::Encoding(_))
        ));
        assert_eq!(WgKey::from_base64("AAAA"), Err(KeyError::Length(3)));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = WgKey::from_base64(PRIVATE).unwrap();
        assert_eq!(format!("{:?}", key), "WgKey(..)");
    }
}
