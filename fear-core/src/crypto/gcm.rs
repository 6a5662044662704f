use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use rand::RngCore;
use thiserror::Error;

use super::key::SessionKey;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AES-GCM encryption failed")]
    Encrypt,
    /// Tag mismatch, wrong key or truncated input. Callers drop the message.
    #[error("AES-GCM authentication failed")]
    Auth,
}

type Result<T> = std::result::Result<T, CryptoError>;

/// Returns a fresh 96-bit nonce from the thread-local CSPRNG.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

fn prepare(key: &SessionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encrypt)
}

/// Encrypts `plaintext` with AES-256-GCM. The 16-byte tag is appended to the
/// returned ciphertext. An empty `aad` is the same as no associated data.
pub fn encrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = prepare(key)?;
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    cipher
        .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        .map_err(|_| CryptoError::Encrypt)
}

/// Decrypts and authenticates `ciphertext` (tag included).
pub fn decrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Auth);
    }
    let cipher = prepare(key).map_err(|_| CryptoError::Auth)?;
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        .map_err(|_| CryptoError::Auth)
}
