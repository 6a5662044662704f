//! Encrypted UDP voice transport.
//!
//! One transport per call. It owns the UDP socket, the capture and playback
//! devices and both codec instances, and runs three tasks:
//!
//! - capture: every frame tick, read PCM, encode, seal and send;
//! - receive: read datagrams, learn the peer from HELLO, open and play audio;
//! - hello: repeat our HELLO until the peer's nonce prefix is known.
//!
//! Outbound audio is discarded (never queued) until a HELLO from the peer
//! has been seen. The latest HELLO always wins: a HELLO from a new address
//! or with a new prefix replaces the current peer.

use fear_core::crypto::SessionKey;
use fear_core::media::packet::{self, AudioPacket, NoncePrefix};
use fear_core::media::{
    AudioCapture, AudioCodec, AudioFormat, AudioPlayback, CodecError, DeviceError, MediaBackend,
    UDP_RECV_BUFFER,
};
use log::{debug, info, trace, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct AudioTransportConfig {
    pub format: AudioFormat,
    pub frame_interval: Duration,
    pub hello_interval: Duration,
    pub hello_max_attempts: u32,
    /// Every Nth attempt sends an extra HELLO.
    pub hello_burst_every: u32,
    pub recv_timeout: Duration,
    /// How long teardown waits for tasks before aborting them.
    pub stop_grace: Duration,
}

impl Default for AudioTransportConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            frame_interval: Duration::from_millis(20),
            hello_interval: Duration::from_millis(50),
            hello_max_attempts: 100,
            hello_burst_every: 20,
            recv_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_millis(100),
        }
    }
}

/// Per-call inputs.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub key: SessionKey,
    /// Where to send. A responder may start without one and learn it from
    /// the first HELLO.
    pub remote: Option<SocketAddr>,
    /// Preferred local port; falls back to an ephemeral port if taken.
    pub local_port: Option<u16>,
    pub is_initiator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// First HELLO from the peer: outbound audio starts flowing.
    PeerReady { addr: SocketAddr, prefix: NoncePrefix },
    /// A later HELLO changed the peer's address or prefix.
    PeerSwitched { addr: SocketAddr, prefix: NoncePrefix },
    /// A loop hit an unrecoverable error. The owner should stop the transport.
    Failed(String),
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub hellos_sent: u64,
    pub hellos_received: u64,
    pub decrypt_failures: u64,
    pub frames_discarded: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("could not bind UDP socket: {0}")]
    Bind(std::io::Error),
    #[error("audio device error: {0}")]
    Device(#[from] DeviceError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    hellos_sent: AtomicU64,
    hellos_received: AtomicU64,
    decrypt_failures: AtomicU64,
    frames_discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MediaStats {
        MediaStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            hellos_sent: self.hellos_sent.load(Ordering::Relaxed),
            hellos_received: self.hellos_received.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Peer {
    addr: Option<SocketAddr>,
    prefix: Option<NoncePrefix>,
}

struct Shared {
    key: SessionKey,
    local_prefix: NoncePrefix,
    is_initiator: bool,
    config: AudioTransportConfig,
    running: AtomicBool,
    remote_ready: AtomicBool,
    tx_seq: AtomicU64,
    peer: Mutex<Peer>,
    // Readers and writers hold the slot for the whole socket operation;
    // close takes it exclusively.
    socket: RwLock<Option<UdpSocket>>,
    capture: Mutex<Option<Box<dyn AudioCapture>>>,
    playback: Mutex<Option<Box<dyn AudioPlayback>>>,
    encoder: Mutex<Option<Box<dyn AudioCodec>>>,
    decoder: Mutex<Option<Box<dyn AudioCodec>>>,
    shutdown: Notify,
    events: mpsc::UnboundedSender<MediaEvent>,
    stats: Counters,
}

/// A running voice transport. Dropping it without [`AudioTransport::stop`]
/// aborts the tasks but skips the orderly device release.
pub struct AudioTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioTransport {
    /// Opens devices and codecs, binds the socket and starts the loops.
    ///
    /// On failure everything opened so far is released again.
    pub async fn start(
        params: TransportParams,
        config: AudioTransportConfig,
        backend: &dyn MediaBackend,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MediaEvent>), MediaError> {
        let format = config.format;
        let capture = scopeguard::guard(backend.open_capture(&format)?, |mut c| c.release());
        let playback = scopeguard::guard(backend.open_playback(&format)?, |mut p| p.release());
        let encoder = scopeguard::guard(backend.create_codec(&format)?, |mut c| c.destroy());
        let decoder = scopeguard::guard(backend.create_codec(&format)?, |mut c| c.destroy());

        let socket = bind_socket(params.local_port, params.remote).await?;
        let local_addr = socket.local_addr()?;
        let local_prefix = packet::random_prefix();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            key: params.key,
            local_prefix,
            is_initiator: params.is_initiator,
            config,
            running: AtomicBool::new(true),
            remote_ready: AtomicBool::new(false),
            tx_seq: AtomicU64::new(0),
            peer: Mutex::new(Peer {
                addr: params.remote,
                prefix: None,
            }),
            socket: RwLock::new(Some(socket)),
            capture: Mutex::new(Some(scopeguard::ScopeGuard::into_inner(capture))),
            playback: Mutex::new(Some(scopeguard::ScopeGuard::into_inner(playback))),
            encoder: Mutex::new(Some(scopeguard::ScopeGuard::into_inner(encoder))),
            decoder: Mutex::new(Some(scopeguard::ScopeGuard::into_inner(decoder))),
            shutdown: Notify::new(),
            events: events_tx,
            stats: Counters::default(),
        });

        info!(
            "Audio transport on {local_addr} (initiator: {}, remote: {})",
            params.is_initiator,
            params
                .remote
                .map(|a| a.to_string())
                .unwrap_or_else(|| "pending".into())
        );

        let receive_task = tokio::spawn(receive_loop(shared.clone()));
        let capture_task = tokio::spawn(capture_loop(shared.clone()));
        shared.send_hello().await;
        let hello_task = tokio::spawn(hello_loop(shared.clone()));

        let transport = Self {
            shared,
            local_addr,
            tasks: Mutex::new(vec![receive_task, capture_task, hello_task]),
        };
        Ok((transport, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_prefix(&self) -> NoncePrefix {
        self.shared.local_prefix
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_remote_ready(&self) -> bool {
        self.shared.remote_ready.load(Ordering::Acquire)
    }

    /// Next outbound sequence number.
    pub fn tx_seq(&self) -> u64 {
        self.shared.tx_seq.load(Ordering::Acquire)
    }

    pub async fn remote_prefix(&self) -> Option<NoncePrefix> {
        self.shared.peer.lock().await.prefix
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.peer.lock().await.addr
    }

    pub fn stats(&self) -> MediaStats {
        self.shared.stats.snapshot()
    }

    /// Tears the call down: stop the loops, stop and release capture then
    /// playback, destroy the codecs, close the socket. Every step runs even
    /// if an earlier one failed. Calling it again is a no-op.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping audio transport on {}", self.local_addr);
        shared.shutdown.notify_waiters();

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let deadline = Instant::now() + shared.config.stop_grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                debug!("Aborting media task that missed the stop deadline");
                handle.abort();
            }
        }

        if let Some(mut capture) = shared.capture.lock().await.take() {
            if let Err(e) = capture.stop() {
                warn!("Failed to stop capture device: {e}");
            }
            capture.release();
        }
        if let Some(mut playback) = shared.playback.lock().await.take() {
            if let Err(e) = playback.stop() {
                warn!("Failed to stop playback device: {e}");
            }
            playback.release();
        }
        for codec in [&shared.encoder, &shared.decoder] {
            if let Some(mut codec) = codec.lock().await.take() {
                codec.destroy();
            }
        }
        if shared.socket.write().await.take().is_some() {
            debug!("UDP socket {} closed", self.local_addr);
        }
        shared.remote_ready.store(false, Ordering::Release);

        let stats = shared.stats.snapshot();
        info!(
            "Audio transport stopped: {} sent, {} received, {} dropped",
            stats.packets_sent, stats.packets_received, stats.decrypt_failures
        );
        let _ = shared.events.send(MediaEvent::Stopped);
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("Audio transport dropped while running");
            self.shared.shutdown.notify_waiters();
            if let Ok(mut tasks) = self.tasks.try_lock() {
                for task in tasks.drain(..) {
                    task.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for AudioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTransport")
            .field("local_addr", &self.local_addr)
            .field("is_initiator", &self.shared.is_initiator)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn bind_socket(
    preferred: Option<u16>,
    remote: Option<SocketAddr>,
) -> Result<UdpSocket, MediaError> {
    let ip: IpAddr = match remote {
        Some(SocketAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
        _ => Ipv4Addr::UNSPECIFIED.into(),
    };
    if let Some(port) = preferred.filter(|p| *p != 0) {
        match UdpSocket::bind((ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => warn!("Could not bind UDP port {port} ({e}), using an ephemeral port"),
        }
    }
    UdpSocket::bind((ip, 0)).await.map_err(MediaError::Bind)
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn fail(&self, reason: String) {
        if self.is_running() {
            warn!("Audio transport failed: {reason}");
            let _ = self.events.send(MediaEvent::Failed(reason));
        }
    }

    /// Sends to the current peer. Returns false if nothing was sent.
    async fn send_datagram(&self, data: &[u8]) -> bool {
        let Some(addr) = self.peer.lock().await.addr else {
            return false;
        };
        let guard = self.socket.read().await;
        let Some(socket) = guard.as_ref() else {
            return false;
        };
        match socket.send_to(data, addr).await {
            Ok(n) => {
                Counters::bump(&self.stats.bytes_sent, n as u64);
                true
            }
            Err(e) => {
                debug!("UDP send to {addr} failed: {e}");
                false
            }
        }
    }

    async fn send_hello(&self) {
        if self.send_datagram(&packet::encode_hello(&self.local_prefix)).await {
            Counters::bump(&self.stats.hellos_sent, 1);
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        Counters::bump(&self.stats.bytes_received, data.len() as u64);
        match AudioPacket::parse(data) {
            Ok(AudioPacket::Hello { prefix }) => self.on_hello(prefix, from).await,
            Ok(AudioPacket::Audio { seq, ciphertext }) => self.on_audio(seq, ciphertext).await,
            Err(e) => trace!("Dropping datagram from {from}: {e}"),
        }
    }

    async fn on_hello(&self, prefix: NoncePrefix, from: SocketAddr) {
        Counters::bump(&self.stats.hellos_received, 1);
        let event = {
            let mut peer = self.peer.lock().await;
            let event = match peer.prefix {
                None => Some(MediaEvent::PeerReady { addr: from, prefix }),
                Some(current) if current != prefix || peer.addr != Some(from) => {
                    Some(MediaEvent::PeerSwitched { addr: from, prefix })
                }
                Some(_) => None,
            };
            peer.addr = Some(from);
            peer.prefix = Some(prefix);
            event
        };
        self.remote_ready.store(true, Ordering::Release);

        if let Some(event) = event {
            info!("HELLO from {from}, remote nonce prefix set");
            let _ = self.events.send(event);
        }
        if !self.is_initiator {
            self.send_hello().await;
        }
    }

    async fn on_audio(&self, seq: u64, ciphertext: &[u8]) {
        let Some(prefix) = self.peer.lock().await.prefix else {
            trace!("Audio before HELLO, dropping seq {seq}");
            return;
        };
        let frame = match packet::open_audio(&self.key, &prefix, seq, ciphertext) {
            Ok(frame) => frame,
            Err(_) => {
                Counters::bump(&self.stats.decrypt_failures, 1);
                trace!("Audio packet {seq} failed authentication");
                return;
            }
        };
        Counters::bump(&self.stats.packets_received, 1);

        let pcm = {
            let mut decoder = self.decoder.lock().await;
            let Some(codec) = decoder.as_mut() else {
                return;
            };
            match codec.decode(&frame, self.config.format.frame_samples) {
                Ok(pcm) => pcm,
                Err(e) => {
                    debug!("Decode of packet {seq} failed: {e}");
                    return;
                }
            }
        };
        if pcm.is_empty() {
            return;
        }

        let mut playback = self.playback.lock().await;
        if let Some(device) = playback.as_mut() {
            if let Err(e) = device.write_frame(&pcm) {
                debug!("Playback write failed: {e}");
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    while shared.is_running() {
        let received = {
            let guard = shared.socket.read().await;
            let Some(socket) = guard.as_ref() else {
                break;
            };
            tokio::select! {
                result = tokio::time::timeout(shared.config.recv_timeout, socket.recv_from(&mut buf)) => result,
                _ = shared.shutdown.notified() => break,
            }
        };
        match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                shared.fail(format!("UDP receive failed: {e}"));
                break;
            }
            Ok(Ok((len, from))) => shared.handle_datagram(&buf[..len], from).await,
        }
    }
    debug!("Audio receive loop stopped");
}

async fn capture_loop(shared: Arc<Shared>) {
    let frame_samples = shared.config.format.frame_samples;
    let mut ticker = tokio::time::interval(shared.config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while shared.is_running() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.shutdown.notified() => break,
        }
        if !shared.is_running() {
            break;
        }

        let pcm = {
            let mut capture = shared.capture.lock().await;
            let Some(device) = capture.as_mut() else {
                break;
            };
            device.read_frame(frame_samples)
        };
        let pcm = match pcm {
            Ok(pcm) => pcm,
            Err(e) => {
                shared.fail(format!("capture failed: {e}"));
                break;
            }
        };

        if !shared.remote_ready.load(Ordering::Acquire) {
            Counters::bump(&shared.stats.frames_discarded, 1);
            continue;
        }
        if pcm.len() < frame_samples {
            continue;
        }

        let encoded = {
            let mut encoder = shared.encoder.lock().await;
            let Some(codec) = encoder.as_mut() else {
                break;
            };
            match codec.encode(&pcm) {
                Ok(encoded) => encoded,
                Err(e) => {
                    debug!("Encode failed: {e}");
                    continue;
                }
            }
        };
        if encoded.is_empty() {
            continue;
        }

        let seq = shared.tx_seq.fetch_add(1, Ordering::AcqRel);
        let datagram = match packet::seal_audio(&shared.key, &shared.local_prefix, seq, &encoded) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Failed to seal audio packet {seq}: {e}");
                continue;
            }
        };
        if shared.send_datagram(&datagram).await {
            let sent = shared.stats.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if sent % 500 == 0 {
                debug!("Sent {sent} audio packets");
            }
        }
    }
    debug!("Audio capture loop stopped");
}

async fn hello_loop(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut attempts = 0u32;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.hello_interval) => {}
            _ = shared.shutdown.notified() => break,
        }
        if !shared.is_running() || shared.remote_ready.load(Ordering::Acquire) {
            break;
        }
        if attempts >= config.hello_max_attempts {
            warn!("No HELLO from peer after {attempts} attempts");
            break;
        }
        shared.send_hello().await;
        attempts += 1;
        if config.hello_burst_every > 0 && attempts % config.hello_burst_every == 0 {
            shared.send_hello().await;
        }
    }
    trace!("HELLO loop done after {attempts} attempts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::headless::HeadlessBackend;

    fn params(remote: Option<SocketAddr>, is_initiator: bool) -> TransportParams {
        TransportParams {
            key: SessionKey::from_slice(&[5; 32]).unwrap(),
            remote,
            local_port: None,
            is_initiator,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_is_idempotent() {
        let backend = HeadlessBackend::default();
        let (transport, mut events) =
            AudioTransport::start(params(None, false), AudioTransportConfig::default(), &backend)
                .await
                .unwrap();
        assert!(transport.is_running());
        assert!(!transport.is_remote_ready());
        assert_ne!(transport.local_addr().port(), 0);

        transport.stop().await;
        assert!(!transport.is_running());
        assert_eq!(events.recv().await, Some(MediaEvent::Stopped));
        transport.stop().await;
        assert_eq!(backend.released_devices(), 2);
    }

    #[tokio::test]
    async fn test_frames_are_discarded_until_peer_is_known() {
        let backend = HeadlessBackend::default();
        let config = AudioTransportConfig {
            frame_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let (transport, _events) = AudioTransport::start(params(None, false), config, &backend)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = transport.stats();
        assert!(stats.frames_discarded > 0);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(transport.tx_seq(), 0);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_preferred_port_falls_back_when_taken() {
        let taken = std::net::UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let backend = HeadlessBackend::default();
        let mut p = params(None, false);
        p.local_port = Some(port);
        let (transport, _events) = AudioTransport::start(p, AudioTransportConfig::default(), &backend)
            .await
            .unwrap();
        assert_ne!(transport.local_addr().port(), port);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_device_failure_releases_partial_resources() {
        let backend = HeadlessBackend::default().fail_playback();
        let err = AudioTransport::start(params(None, true), AudioTransportConfig::default(), &backend)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Device(_)));
        assert_eq!(backend.released_devices(), 1);
    }
}
