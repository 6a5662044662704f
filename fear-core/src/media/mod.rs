//! Voice media: the UDP datagram format and the contracts for the audio
//! collaborators (capture device, playback device, codec) that live outside
//! this crate.

pub mod packet;

pub use packet::{AudioPacket, NoncePrefix, PacketError};

use thiserror::Error;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1;
pub const FRAME_DURATION_MS: u64 = 20;
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize;
pub const UDP_RECV_BUFFER: usize = 1500;

/// PCM layout every collaborator agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),
    #[error("audio device I/O failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec initialisation failed: {0}")]
    Init(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Microphone side of the duplex PCM device.
pub trait AudioCapture: Send {
    /// Returns the next frame of `frame_samples` samples. Implementations
    /// buffer internally and must not block for longer than one frame.
    fn read_frame(&mut self, frame_samples: usize) -> Result<Vec<i16>, DeviceError>;
    fn stop(&mut self) -> Result<(), DeviceError>;
    fn release(&mut self);
}

/// Speaker side of the duplex PCM device.
pub trait AudioPlayback: Send {
    fn write_frame(&mut self, pcm: &[i16]) -> Result<usize, DeviceError>;
    fn stop(&mut self) -> Result<(), DeviceError>;
    fn release(&mut self);
}

/// Opaque voice codec. An empty result means "nothing produced this call".
pub trait AudioCodec: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
    fn decode(&mut self, data: &[u8], frame_samples: usize) -> Result<Vec<i16>, CodecError>;
    fn destroy(&mut self);
}

/// Opens the collaborators for one call. A call owns what it opens and
/// releases everything on teardown.
pub trait MediaBackend: Send + Sync {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn AudioCapture>, DeviceError>;
    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, DeviceError>;
    fn create_codec(&self, format: &AudioFormat) -> Result<Box<dyn AudioCodec>, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.frame_samples, 960);
        assert_eq!(format.sample_rate, 48_000);
        assert_eq!(format.channels, 1);
    }
}
