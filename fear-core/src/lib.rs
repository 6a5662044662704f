//! Platform-agnostic protocol core: authenticated framing, AEAD, the audio
//! datagram format, call signaling and the file transfer protocol. Nothing
//! here touches sockets or a runtime.

pub mod calls;
pub mod crypto;
pub mod framing;
pub mod media;
pub mod protocol;
pub mod transfer;
