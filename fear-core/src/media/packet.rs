//! UDP audio datagrams.
//!
//! ```text
//! HELLO: 0x7F | prefix(4)
//! AUDIO: 0x01 | seq(u64 BE) | AES-256-GCM(frame, nonce = prefix || seq BE, aad = empty)
//! ```

use thiserror::Error;

use crate::crypto::{self, CryptoError, NONCE_LEN, SessionKey, TAG_LEN};

pub const PKT_VER_AUDIO: u8 = 0x01;
pub const PKT_VER_HELLO: u8 = 0x7F;
pub const NONCE_PREFIX_LEN: usize = 4;
pub const AUDIO_HEADER_LEN: usize = 1 + 8;

/// The per-direction 4-byte half of every audio nonce.
pub type NoncePrefix = [u8; NONCE_PREFIX_LEN];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown packet version 0x{0:02x}")]
    UnknownVersion(u8),
    #[error("{kind} packet too short: {len} bytes")]
    TooShort { kind: &'static str, len: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A parsed, still-encrypted UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPacket<'a> {
    Hello { prefix: NoncePrefix },
    Audio { seq: u64, ciphertext: &'a [u8] },
}

pub fn random_prefix() -> NoncePrefix {
    rand::random()
}

/// Builds the 12-byte nonce `prefix || seq` (sequence big-endian).
pub fn audio_nonce(prefix: &NoncePrefix, seq: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

pub fn encode_hello(prefix: &NoncePrefix) -> [u8; 1 + NONCE_PREFIX_LEN] {
    let mut out = [0u8; 1 + NONCE_PREFIX_LEN];
    out[0] = PKT_VER_HELLO;
    out[1..].copy_from_slice(prefix);
    out
}

/// Encrypts one encoded audio frame into a complete AUDIO datagram.
pub fn seal_audio(
    key: &SessionKey,
    prefix: &NoncePrefix,
    seq: u64,
    frame: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let ciphertext = crypto::encrypt(key, &audio_nonce(prefix, seq), frame, &[])?;
    let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + ciphertext.len());
    out.push(PKT_VER_AUDIO);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts the payload of an AUDIO datagram sent with `prefix`.
pub fn open_audio(
    key: &SessionKey,
    prefix: &NoncePrefix,
    seq: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, PacketError> {
    Ok(crypto::decrypt(key, &audio_nonce(prefix, seq), ciphertext, &[])?)
}

impl<'a> AudioPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let (&version, rest) = data.split_first().ok_or(PacketError::Empty)?;
        match version {
            PKT_VER_HELLO => {
                let prefix: NoncePrefix = rest
                    .get(..NONCE_PREFIX_LEN)
                    .and_then(|p| p.try_into().ok())
                    .ok_or(PacketError::TooShort {
                        kind: "hello",
                        len: data.len(),
                    })?;
                Ok(Self::Hello { prefix })
            }
            PKT_VER_AUDIO => {
                if data.len() < AUDIO_HEADER_LEN + TAG_LEN {
                    return Err(PacketError::TooShort {
                        kind: "audio",
                        len: data.len(),
                    });
                }
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&rest[..8]);
                Ok(Self::Audio {
                    seq: u64::from_be_bytes(seq),
                    ciphertext: &rest[8..],
                })
            }
            other => Err(PacketError::UnknownVersion(other)),
        }
    }
}
