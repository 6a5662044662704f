//! Shared 32-byte room key.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;

/// URL-safe alphabet, unpadded on encode, padding tolerated on decode.
pub const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("key is not valid base64: {0}")]
    Base64(String),
    #[error("key is not valid hex: {0}")]
    Hex(String),
}

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parses the room key as distributed to chat members.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut raw = URL_SAFE_LENIENT
            .decode(encoded.trim())
            .map_err(|e| KeyError::Base64(e.to_string()))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Parses the 64-character hex key used for direct dial.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let mut raw = hex::decode(encoded.trim()).map_err(|e| KeyError::Hex(e.to_string()))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_LENIENT.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}
