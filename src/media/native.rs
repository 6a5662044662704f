//! Sound-card backend: cpal streams for microphone and speaker, Opus on
//! the wire.
//!
//! A cpal stream is not `Send`, so each device runs on a dedicated thread
//! that owns its stream. The call side only touches the shared sample
//! queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use fear_core::media::{
    AudioCapture, AudioCodec, AudioFormat, AudioPlayback, CodecError, DeviceError, MediaBackend,
};
use log::{error, info, warn};
use opus::{Application, Bitrate, Channels, Decoder as OpusDecoder, Encoder as OpusEncoder};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

const OPUS_BITRATE: i32 = 24_000;
/// Largest packet libopus produces.
const MAX_OPUS_PACKET: usize = 1275;
/// Queue bound in frames; older samples are dropped past it.
const MAX_QUEUED_FRAMES: usize = 10;
const STOP_POLL: Duration = Duration::from_millis(5);

type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

fn trim_front(queue: &mut VecDeque<i16>, limit: usize) {
    let excess = queue.len().saturating_sub(limit);
    queue.drain(..excess);
}

/// First f32 mono config at `rate`, else the first f32 stereo one.
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
) -> Option<StreamConfig> {
    let mut best = None;
    for range in ranges {
        if range.sample_format() != SampleFormat::F32 || range.channels() > 2 {
            continue;
        }
        if range.min_sample_rate().0 > rate || range.max_sample_rate().0 < rate {
            continue;
        }
        let mono = range.channels() == 1;
        if mono || best.is_none() {
            best = Some(range.with_sample_rate(SampleRate(rate)).config());
            if mono {
                break;
            }
        }
    }
    best
}

/// Thread keeping one cpal stream alive until stopped.
struct DeviceThread {
    label: &'static str,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Runs `build` on a new thread and returns once the stream is playing,
    /// or with the error that kept it from starting.
    fn spawn<F>(label: &'static str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = std::thread::Builder::new()
            .name(format!("fear-{label}"))
            .spawn(move || {
                let started = build().and_then(|stream| {
                    stream
                        .play()
                        .map(|()| stream)
                        .map_err(|e| DeviceError::Unavailable(e.to_string()))
                });
                let stream = match started {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::sleep(STOP_POLL);
                }
                drop(stream);
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio {label} started");
                Ok(Self {
                    label,
                    stop,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Unavailable(format!("{label} thread exited")))
            }
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio {} thread panicked", self.label);
            }
            info!("Audio {} stopped", self.label);
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default input device, downmixed to mono.
pub struct CpalCapture {
    queue: SampleQueue,
    device: Option<DeviceThread>,
}

impl CpalCapture {
    pub fn open(format: &AudioFormat) -> Result<Self, DeviceError> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let limit = format.frame_samples * MAX_QUEUED_FRAMES;
        let rate = format.sample_rate;
        let producer = queue.clone();

        let device = DeviceThread::spawn("capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| DeviceError::Unavailable("no input device".into()))?;
            info!("Call audio input device: {}", device.name().unwrap_or_default());
            let ranges = device
                .supported_input_configs()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
            let config = pick_config(ranges, rate).ok_or_else(|| {
                DeviceError::Unavailable(format!("input device cannot capture at {rate} Hz"))
            })?;
            let channels = config.channels as usize;

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let Ok(mut queue) = producer.lock() else {
                            return;
                        };
                        for frame in data.chunks(channels) {
                            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                            queue.push_back(to_i16(mono));
                        }
                        trim_front(&mut queue, limit);
                    },
                    |err| error!("Call audio input error: {err}"),
                    None,
                )
                .map_err(|e| DeviceError::Unavailable(e.to_string()))
        })?;

        Ok(Self {
            queue,
            device: Some(device),
        })
    }
}

impl AudioCapture for CpalCapture {
    /// Returns an empty frame until a full one has been captured.
    fn read_frame(&mut self, frame_samples: usize) -> Result<Vec<i16>, DeviceError> {
        if self.device.is_none() {
            return Err(DeviceError::Io("capture stopped".into()));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| DeviceError::Io("capture queue poisoned".into()))?;
        if queue.len() < frame_samples {
            return Ok(Vec::new());
        }
        Ok(queue.drain(..frame_samples).collect())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.device.take();
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

/// Default output device; mono frames are copied to every channel.
pub struct CpalPlayback {
    queue: SampleQueue,
    limit: usize,
    device: Option<DeviceThread>,
}

impl CpalPlayback {
    pub fn open(format: &AudioFormat) -> Result<Self, DeviceError> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let rate = format.sample_rate;
        let consumer = queue.clone();

        let device = DeviceThread::spawn("playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| DeviceError::Unavailable("no output device".into()))?;
            info!("Call audio output device: {}", device.name().unwrap_or_default());
            let ranges = device
                .supported_output_configs()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
            let config = pick_config(ranges, rate).ok_or_else(|| {
                DeviceError::Unavailable(format!("output device cannot play at {rate} Hz"))
            })?;
            let channels = config.channels as usize;

            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = consumer.lock().ok();
                        for frame in data.chunks_mut(channels) {
                            let sample = queue
                                .as_mut()
                                .and_then(|q| q.pop_front())
                                .map(to_f32)
                                .unwrap_or(0.0);
                            frame.fill(sample);
                        }
                    },
                    |err| error!("Call audio output error: {err}"),
                    None,
                )
                .map_err(|e| DeviceError::Unavailable(e.to_string()))
        })?;

        Ok(Self {
            queue,
            limit: format.frame_samples * MAX_QUEUED_FRAMES,
            device: Some(device),
        })
    }
}

impl AudioPlayback for CpalPlayback {
    fn write_frame(&mut self, pcm: &[i16]) -> Result<usize, DeviceError> {
        if self.device.is_none() {
            return Err(DeviceError::Io("playback stopped".into()));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| DeviceError::Io("playback queue poisoned".into()))?;
        queue.extend(pcm.iter().copied());
        trim_front(&mut queue, self.limit);
        Ok(pcm.len())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.device.take();
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

/// Opus in VoIP mode at 24 kbit/s, one packet per 20 ms frame.
pub struct OpusCodec {
    encoder: Option<OpusEncoder>,
    decoder: Option<OpusDecoder>,
    channels: usize,
    packet: Vec<u8>,
}

impl OpusCodec {
    pub fn new(format: &AudioFormat) -> Result<Self, CodecError> {
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => return Err(CodecError::Init(format!("opus cannot carry {n} channels"))),
        };
        let mut encoder = OpusEncoder::new(format.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| CodecError::Init(e.to_string()))?;
        let decoder = OpusDecoder::new(format.sample_rate, channels)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self {
            encoder: Some(encoder),
            decoder: Some(decoder),
            channels: format.channels as usize,
            packet: vec![0; MAX_OPUS_PACKET],
        })
    }
}

impl AudioCodec for OpusCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::Encode("codec destroyed".into()))?;
        let len = encoder
            .encode(pcm, &mut self.packet)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(self.packet[..len].to_vec())
    }

    fn decode(&mut self, data: &[u8], frame_samples: usize) -> Result<Vec<i16>, CodecError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| CodecError::Decode("codec destroyed".into()))?;
        let mut pcm = vec![0i16; frame_samples * self.channels];
        let samples = decoder
            .decode(data, &mut pcm, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        pcm.truncate(samples * self.channels);
        Ok(pcm)
    }

    fn destroy(&mut self) {
        self.encoder.take();
        self.decoder.take();
    }
}

/// The system's default microphone and speaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl MediaBackend for CpalBackend {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn AudioCapture>, DeviceError> {
        Ok(Box::new(CpalCapture::open(format)?))
    }

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, DeviceError> {
        Ok(Box::new(CpalPlayback::open(format)?))
    }

    fn create_codec(&self, format: &AudioFormat) -> Result<Box<dyn AudioCodec>, CodecError> {
        Ok(Box::new(OpusCodec::new(format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;
    use fear_core::crypto::gcm::TAG_LEN;
    use fear_core::media::UDP_RECV_BUFFER;
    use fear_core::media::packet::AUDIO_HEADER_LEN;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    fn tone(samples: usize) -> Vec<i16> {
        (0..samples)
            .map(|i| ((i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_opus_frame_fits_one_datagram() {
        let format = AudioFormat::default();
        let mut codec = OpusCodec::new(&format).unwrap();
        let pcm = tone(format.frame_samples);

        let packet = codec.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(AUDIO_HEADER_LEN + packet.len() + TAG_LEN <= UDP_RECV_BUFFER);

        let decoded = codec.decode(&packet, format.frame_samples).unwrap();
        assert_eq!(decoded.len(), format.frame_samples);
    }

    #[test]
    fn test_destroyed_opus_codec_refuses_work() {
        let format = AudioFormat::default();
        let mut codec = OpusCodec::new(&format).unwrap();
        codec.destroy();
        assert!(matches!(codec.encode(&tone(960)), Err(CodecError::Encode(_))));
        assert!(matches!(codec.decode(&[0xF8], 960), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_opus_rejects_surround_layouts() {
        let format = AudioFormat {
            channels: 6,
            ..AudioFormat::default()
        };
        assert!(matches!(OpusCodec::new(&format), Err(CodecError::Init(_))));
    }

    #[test]
    fn test_pick_config_prefers_mono_f32() {
        let ranges = vec![
            range(2, 8_000, 96_000, SampleFormat::F32),
            range(1, 8_000, 96_000, SampleFormat::I16),
            range(1, 44_100, 48_000, SampleFormat::F32),
        ];
        let config = pick_config(ranges.into_iter(), 48_000).unwrap();
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate, SampleRate(48_000));

        let stereo_only = vec![range(2, 48_000, 48_000, SampleFormat::F32)];
        assert_eq!(pick_config(stereo_only.into_iter(), 48_000).unwrap().channels, 2);

        let wrong_rate = vec![range(1, 8_000, 16_000, SampleFormat::F32)];
        assert!(pick_config(wrong_rate.into_iter(), 48_000).is_none());
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
        assert!((to_f32(i16::MAX) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_queue_keeps_newest_samples() {
        let mut queue: VecDeque<i16> = (0..10).collect();
        trim_front(&mut queue, 4);
        assert_eq!(queue, VecDeque::from(vec![6, 7, 8, 9]));
    }
}
