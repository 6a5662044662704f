//! Media backend used by the test suites: the microphone is silent,
//! playback only counts frames, and frames are carried as G.711 µ-law so
//! tests need no sound hardware. Real calls use the cpal/Opus backend.

use fear_core::media::{
    AudioCapture, AudioCodec, AudioFormat, AudioPlayback, CodecError, DeviceError, MediaBackend,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte as i32;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// G.711 µ-law, one byte per sample.
#[derive(Debug, Default)]
pub struct MuLawCodec {
    destroyed: bool,
}

impl AudioCodec for MuLawCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if self.destroyed {
            return Err(CodecError::Encode("codec destroyed".into()));
        }
        Ok(pcm.iter().map(|&s| linear_to_ulaw(s)).collect())
    }

    fn decode(&mut self, data: &[u8], frame_samples: usize) -> Result<Vec<i16>, CodecError> {
        if self.destroyed {
            return Err(CodecError::Decode("codec destroyed".into()));
        }
        if data.len() > frame_samples {
            return Err(CodecError::Decode(format!(
                "{} samples exceed frame of {frame_samples}",
                data.len()
            )));
        }
        Ok(data.iter().map(|&b| ulaw_to_linear(b)).collect())
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}

#[derive(Debug)]
pub struct SilentCapture {
    released: Arc<AtomicUsize>,
}

impl AudioCapture for SilentCapture {
    fn read_frame(&mut self, frame_samples: usize) -> Result<Vec<i16>, DeviceError> {
        Ok(vec![0; frame_samples])
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct DiscardPlayback {
    played: Arc<AtomicU64>,
    released: Arc<AtomicUsize>,
}

impl AudioPlayback for DiscardPlayback {
    fn write_frame(&mut self, pcm: &[i16]) -> Result<usize, DeviceError> {
        self.played.fetch_add(1, Ordering::Relaxed);
        Ok(pcm.len())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    played: Arc<AtomicU64>,
    released: Arc<AtomicUsize>,
    fail_capture: bool,
    fail_playback: bool,
}

impl HeadlessBackend {
    pub fn fail_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn fail_playback(mut self) -> Self {
        self.fail_playback = true;
        self
    }

    /// Frames handed to playback across all calls.
    pub fn frames_played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    /// Capture and playback devices released across all calls.
    pub fn released_devices(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

impl MediaBackend for HeadlessBackend {
    fn open_capture(&self, _format: &AudioFormat) -> Result<Box<dyn AudioCapture>, DeviceError> {
        if self.fail_capture {
            return Err(DeviceError::Unavailable("no microphone".into()));
        }
        Ok(Box::new(SilentCapture {
            released: self.released.clone(),
        }))
    }

    fn open_playback(&self, _format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, DeviceError> {
        if self.fail_playback {
            return Err(DeviceError::Unavailable("no speaker".into()));
        }
        Ok(Box::new(DiscardPlayback {
            played: self.played.clone(),
            released: self.released.clone(),
        }))
    }

    fn create_codec(&self, _format: &AudioFormat) -> Result<Box<dyn AudioCodec>, CodecError> {
        Ok(Box::new(MuLawCodec::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_silence_and_error_bound() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        for sample in [1i16, -1, 100, -100, 1000, -1000, 12345, -12345, i16::MAX, i16::MIN] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample)) as i32;
            let tolerance = (sample as i32).abs() / 8 + 16;
            assert!(
                (decoded - sample as i32).abs() <= tolerance,
                "{sample} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn test_codec_frame_size() {
        let mut codec = MuLawCodec::default();
        let encoded = codec.encode(&[0i16; 960]).unwrap();
        assert_eq!(encoded.len(), 960);
        assert_eq!(codec.decode(&encoded, 960).unwrap().len(), 960);
        assert!(codec.decode(&encoded, 480).is_err());
        codec.destroy();
        assert!(codec.encode(&[0]).is_err());
    }
}
