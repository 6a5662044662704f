use crate::socket::error::{Result, SocketError};
use fear_core::framing::{ControlFrame, FrameDecoder};
use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// What the read pump delivers. The channel closes once the connection is gone.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(ControlFrame),
    /// The stream carried bytes that are not a valid frame. Nothing more
    /// will be read.
    Malformed(SocketError),
}

/// TCP connection carrying control frames.
///
/// Reads run on a dedicated pump task; writes from any task are serialized
/// by the lock around the write half.
pub struct FrameSocket {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    events_tx: Mutex<Option<Sender<SocketEvent>>>,
    is_connected: Arc<Mutex<bool>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSocket {
    pub fn new() -> (Self, Receiver<SocketEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let socket = Self {
            writer: Arc::new(Mutex::new(None)),
            events_tx: Mutex::new(Some(tx)),
            is_connected: Arc::new(Mutex::new(false)),
            peer_addr: Mutex::new(None),
            read_task: Mutex::new(None),
        };
        (socket, rx)
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.lock().await
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().await
    }

    /// Dials `host:port` and starts the read pump. A socket connects once.
    pub async fn connect(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.is_connected().await {
            return Err(SocketError::SocketAlreadyOpen);
        }
        let events_tx = self
            .events_tx
            .lock()
            .await
            .take()
            .ok_or(SocketError::SocketClosed)?;

        info!("Dialing {host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);
        *self.peer_addr.lock().await = Some(peer);
        *self.is_connected.lock().await = true;

        let handle = tokio::task::spawn(Self::read_pump(
            reader,
            events_tx,
            self.is_connected.clone(),
        ));
        *self.read_task.lock().await = Some(handle);
        info!("Connected to {peer}");
        Ok(peer)
    }

    /// Writes one complete, already-encoded frame.
    pub async fn send_frame(&self, data: &[u8]) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(SocketError::SocketClosed)?;
        debug!("--> Sending frame: {} bytes", data.len());
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_pump(
        mut reader: OwnedReadHalf,
        events_tx: Sender<SocketEvent>,
        is_connected: Arc<Mutex<bool>>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        'pump: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    trace!("Control stream ended");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("Error reading from control socket: {e}");
                    break;
                }
            };
            trace!("<-- Received {n} bytes");
            decoder.feed(&buf[..n]);

            loop {
                match decoder.decode_frame() {
                    Ok(Some(frame)) => {
                        if events_tx.send(SocketEvent::Frame(frame)).await.is_err() {
                            warn!("Frame receiver dropped, closing read pump");
                            break 'pump;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Malformed frame on control socket: {e}");
                        let _ = events_tx.send(SocketEvent::Malformed(e.into())).await;
                        break 'pump;
                    }
                }
            }
        }

        *is_connected.lock().await = false;
    }

    pub async fn close(&self) {
        let mut is_connected = self.is_connected.lock().await;
        *is_connected = false;
        drop(is_connected);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down control socket: {e}");
            }
        }
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        // Never connected: dropping the sender still ends the consumer.
        self.events_tx.lock().await.take();
    }
}
