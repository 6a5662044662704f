//! Authenticated control-channel framing.
//!
//! Every frame on the TCP control channel has the layout (integers little-endian):
//!
//! ```text
//! u16 roomLen | room | u16 nameLen | name | u16 nonceLen | nonce(12) | u8 type | u32 cipherLen | ciphertext
//! ```
//!
//! The ciphertext is AES-256-GCM over the payload with
//! `u16(roomLen) || room || u16(nameLen) || name` as associated data, so a frame
//! cannot be replayed into another room or under another sender name.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use thiserror::Error;

use crate::crypto::{self, CryptoError, NONCE_LEN, SessionKey};
use crate::protocol::{MAX_CIPHERTEXT_LEN, MAX_NAME_LEN, MAX_ROOM_LEN, MessageType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("room is too long (max: {MAX_ROOM_LEN}, got: {0})")]
    RoomTooLong(usize),
    #[error("sender name is too long (max: {MAX_NAME_LEN}, got: {0})")]
    NameTooLong(usize),
    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),
    #[error("ciphertext is too large (max: {MAX_CIPHERTEXT_LEN}, got: {0})")]
    CiphertextTooLarge(usize),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("frame is truncated")]
    Truncated,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

type Result<T> = std::result::Result<T, FrameError>;

/// A parsed control frame. The payload is still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub room: String,
    pub sender: String,
    pub nonce: [u8; NONCE_LEN],
    pub msg_type: MessageType,
    pub ciphertext: Bytes,
}

/// Associated data binding a frame to its room and sender.
pub fn associated_data(room: &[u8], sender: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + room.len() + sender.len());
    aad.put_u16_le(room.len() as u16);
    aad.extend_from_slice(room);
    aad.put_u16_le(sender.len() as u16);
    aad.extend_from_slice(sender);
    aad
}

/// Encrypts `plaintext` under a fresh nonce and serializes the complete frame.
pub fn encode_frame(
    room: &str,
    sender: &str,
    msg_type: MessageType,
    plaintext: &[u8],
    key: &SessionKey,
) -> Result<Vec<u8>> {
    check_header_lengths(room.len(), sender.len())?;
    let nonce = crypto::generate_nonce();
    let aad = associated_data(room.as_bytes(), sender.as_bytes());
    let ciphertext = crypto::encrypt(key, &nonce, plaintext, &aad)?;

    let frame = ControlFrame {
        room: room.to_owned(),
        sender: sender.to_owned(),
        nonce,
        msg_type,
        ciphertext: Bytes::from(ciphertext),
    };
    let data = frame.to_bytes()?;
    trace!(
        "--> Encoded frame type {} for room {room}: {} bytes",
        msg_type.as_u8(),
        data.len()
    );
    Ok(data)
}

/// Parses exactly one frame occupying all of `data`.
pub fn decode_frame(data: &[u8]) -> Result<ControlFrame> {
    match parse_frame(data)? {
        Some((frame, used)) if used == data.len() => Ok(frame),
        Some((_, used)) => Err(FrameError::TrailingBytes(data.len() - used)),
        None => Err(FrameError::Truncated),
    }
}

fn check_header_lengths(room_len: usize, name_len: usize) -> Result<()> {
    if room_len > MAX_ROOM_LEN {
        return Err(FrameError::RoomTooLong(room_len));
    }
    if name_len > MAX_NAME_LEN {
        return Err(FrameError::NameTooLong(name_len));
    }
    Ok(())
}

impl ControlFrame {
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(self.room.as_bytes(), self.sender.as_bytes())
    }

    /// Authenticates and decrypts the payload using the frame's own header as AAD.
    pub fn open(&self, key: &SessionKey) -> std::result::Result<Vec<u8>, CryptoError> {
        crypto::decrypt(key, &self.nonce, &self.ciphertext, &self.associated_data())
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.room.len() + 2 + self.sender.len() + 2 + NONCE_LEN + 1 + 4 + self.ciphertext.len()
    }

    /// Serializes the frame byte-for-byte as it appears on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_header_lengths(self.room.len(), self.sender.len())?;
        if self.ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(FrameError::CiphertextTooLarge(self.ciphertext.len()));
        }
        let mut out = Vec::with_capacity(self.encoded_len());
        out.put_u16_le(self.room.len() as u16);
        out.extend_from_slice(self.room.as_bytes());
        out.put_u16_le(self.sender.len() as u16);
        out.extend_from_slice(self.sender.as_bytes());
        out.put_u16_le(NONCE_LEN as u16);
        out.extend_from_slice(&self.nonce);
        out.put_u8(self.msg_type.as_u8());
        out.put_u32_le(self.ciphertext.len() as u32);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parses one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Each length field is
/// validated as soon as it is readable, so an oversized field is rejected
/// without waiting for the bytes it announces.
fn parse_frame(buf: &[u8]) -> Result<Option<(ControlFrame, usize)>> {
    let mut r = Reader { buf, pos: 0 };

    let Some(room_len) = r.u16_le() else { return Ok(None) };
    let room_len = room_len as usize;
    if room_len > MAX_ROOM_LEN {
        return Err(FrameError::RoomTooLong(room_len));
    }
    let Some(room) = r.take(room_len) else { return Ok(None) };

    let Some(name_len) = r.u16_le() else { return Ok(None) };
    let name_len = name_len as usize;
    if name_len > MAX_NAME_LEN {
        return Err(FrameError::NameTooLong(name_len));
    }
    let Some(sender) = r.take(name_len) else { return Ok(None) };

    let Some(nonce_len) = r.u16_le() else { return Ok(None) };
    if nonce_len as usize != NONCE_LEN {
        return Err(FrameError::InvalidNonceLength(nonce_len as usize));
    }
    let Some(nonce) = r.take(NONCE_LEN) else { return Ok(None) };
    let Some(msg_type) = r.u8() else { return Ok(None) };

    let Some(cipher_len) = r.u32_le() else { return Ok(None) };
    let cipher_len = cipher_len as usize;
    if cipher_len > MAX_CIPHERTEXT_LEN {
        return Err(FrameError::CiphertextTooLarge(cipher_len));
    }
    let Some(ciphertext) = r.take(cipher_len) else { return Ok(None) };

    let room = std::str::from_utf8(room).map_err(|_| FrameError::InvalidUtf8("room"))?;
    let sender = std::str::from_utf8(sender).map_err(|_| FrameError::InvalidUtf8("sender"))?;
    let mut nonce_arr = [0u8; NONCE_LEN];
    nonce_arr.copy_from_slice(nonce);

    let frame = ControlFrame {
        room: room.to_owned(),
        sender: sender.to_owned(),
        nonce: nonce_arr,
        msg_type: MessageType::from(msg_type),
        ciphertext: Bytes::copy_from_slice(ciphertext),
    };
    Ok(Some((frame, r.pos)))
}

/// Buffers stream bytes and yields complete control frames.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds raw data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode the next complete frame from the buffer.
    ///
    /// An error means the stream is corrupt and must be abandoned.
    pub fn decode_frame(&mut self) -> Result<Option<ControlFrame>> {
        match parse_frame(&self.buffer)? {
            Some((frame, used)) => {
                self.buffer.advance(used);
                trace!("<-- Decoded frame: {used} bytes");
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_slice(&[0x42; 32]).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let k = key();
        let data = encode_frame("r1", "alice", MessageType::Text, b"hi", &k).unwrap();
        let frame = decode_frame(&data).unwrap();
        assert_eq!(frame.room, "r1");
        assert_eq!(frame.sender, "alice");
        assert_eq!(frame.msg_type, MessageType::Text);
        assert_eq!(frame.open(&k).unwrap(), b"hi");
        assert_eq!(frame.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_header_layout() {
        let data = encode_frame("ab", "c", MessageType::UdpInfo, b"", &key()).unwrap();
        assert_eq!(&data[0..2], &[2, 0]);
        assert_eq!(&data[2..4], b"ab");
        assert_eq!(&data[4..6], &[1, 0]);
        assert_eq!(data[6], b'c');
        assert_eq!(&data[7..9], &[12, 0]);
        assert_eq!(data[21], 14);
        assert_eq!(&data[22..26], &16u32.to_le_bytes());
        assert_eq!(data.len(), 26 + 16);
    }

    #[test]
    fn test_aad_binds_room_and_sender() {
        let k = key();
        let data = encode_frame("r1", "alice", MessageType::Text, b"hi", &k).unwrap();
        let mut frame = decode_frame(&data).unwrap();
        frame.room = "r2".into();
        assert_eq!(frame.open(&k), Err(CryptoError::Auth));

        let mut frame = decode_frame(&data).unwrap();
        frame.sender = "mallory".into();
        assert_eq!(frame.open(&k), Err(CryptoError::Auth));
    }

    #[test]
    fn test_oversized_room_rejected_from_prefix_alone() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&257u16.to_le_bytes());
        assert_eq!(decoder.decode_frame(), Err(FrameError::RoomTooLong(257)));
    }

    #[test]
    fn test_oversized_name_rejected() {
        let mut bytes = vec![1, 0, b'r'];
        bytes.extend_from_slice(&300u16.to_le_bytes());
        assert_eq!(decode_frame(&bytes), Err(FrameError::NameTooLong(300)));
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let mut bytes = vec![1, 0, b'r', 1, 0, b'n'];
        bytes.extend_from_slice(&11u16.to_le_bytes());
        assert_eq!(decode_frame(&bytes), Err(FrameError::InvalidNonceLength(11)));
    }

    #[test]
    fn test_oversized_ciphertext_rejected() {
        let mut bytes = vec![1, 0, b'r', 1, 0, b'n', 12, 0];
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.push(0);
        bytes.extend_from_slice(&65537u32.to_le_bytes());
        assert_eq!(decode_frame(&bytes), Err(FrameError::CiphertextTooLarge(65537)));
    }

    #[test]
    fn test_encode_rejects_long_fields() {
        let long = "x".repeat(257);
        assert_eq!(
            encode_frame(&long, "a", MessageType::Text, b"", &key()),
            Err(FrameError::RoomTooLong(257))
        );
        assert_eq!(
            encode_frame("r", &long, MessageType::Text, b"", &key()),
            Err(FrameError::NameTooLong(257))
        );
        let big = vec![0u8; MAX_CIPHERTEXT_LEN];
        assert_eq!(
            encode_frame("r", "a", MessageType::FileChunk, &big, &key()),
            Err(FrameError::CiphertextTooLarge(MAX_CIPHERTEXT_LEN + 16))
        );
    }

    #[test]
    fn test_invalid_utf8_room() {
        let frame = ControlFrame {
            room: "r".into(),
            sender: "s".into(),
            nonce: [0; NONCE_LEN],
            msg_type: MessageType::Text,
            ciphertext: Bytes::new(),
        };
        let mut bytes = frame.to_bytes().unwrap();
        bytes[2] = 0xFF;
        assert_eq!(decode_frame(&bytes), Err(FrameError::InvalidUtf8("room")));
    }

    #[test]
    fn test_decoder_handles_split_and_batched_input() {
        let k = key();
        let a = encode_frame("r1", "alice", MessageType::Text, b"one", &k).unwrap();
        let b = encode_frame("r1", "bob", MessageType::Unknown(99), b"two", &k).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&a[..5]);
        assert_eq!(decoder.decode_frame(), Ok(None));
        decoder.feed(&a[5..]);
        decoder.feed(&b);

        let first = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(first.open(&k).unwrap(), b"one");
        let second = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(second.msg_type, MessageType::Unknown(99));
        assert_eq!(second.open(&k).unwrap(), b"two");
        assert_eq!(decoder.decode_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_reports_truncation_and_trailing_bytes() {
        let data = encode_frame("r1", "alice", MessageType::Text, b"hi", &key()).unwrap();
        assert_eq!(decode_frame(&data[..data.len() - 1]), Err(FrameError::Truncated));
        let mut extra = data.clone();
        extra.push(0);
        assert_eq!(decode_frame(&extra), Err(FrameError::TrailingBytes(1)));
    }
}
