//! Frame relay. Every well-formed frame a client sends is forwarded
//! unchanged to every other connected client; room filtering and
//! decryption happen on the clients, the relay never holds a key.

use bytes::Bytes;
use fear_core::framing::FrameDecoder;
use log::{debug, info, trace, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const FANOUT_CAPACITY: usize = 1024;

type Outbound = (u64, Bytes);

pub struct Relay {
    listener: TcpListener,
    fanout: broadcast::Sender<Outbound>,
    next_client: AtomicU64,
}

impl Relay {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Ok(Self {
            listener,
            fanout,
            next_client: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let id = self.next_client.fetch_add(1, Ordering::Relaxed);
            info!("Client {id} connected from {addr}");
            tokio::spawn(serve_client(id, addr, stream, self.fanout.clone()));
        }
    }
}

async fn serve_client(
    id: u64,
    addr: SocketAddr,
    stream: TcpStream,
    fanout: broadcast::Sender<Outbound>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {addr}: {e}");
    }
    let (reader, writer) = stream.into_split();
    let mut writer_task = tokio::spawn(forward_to_client(id, writer, fanout.subscribe()));

    tokio::select! {
        _ = read_from_client(id, reader, &fanout) => {}
        _ = &mut writer_task => {}
    }
    writer_task.abort();
    info!("Client {id} ({addr}) disconnected");
}

async fn read_from_client(id: u64, mut reader: OwnedReadHalf, fanout: &broadcast::Sender<Outbound>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("Read error from client {id}: {e}");
                return;
            }
        };
        decoder.feed(&buf[..n]);
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => {
                    let data = match frame.to_bytes() {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Client {id} sent an unencodable frame: {e}");
                            return;
                        }
                    };
                    trace!(
                        "Relaying {} bytes from client {id} ({} in room {})",
                        data.len(),
                        frame.sender,
                        frame.room
                    );
                    // No receivers just means nobody else is connected.
                    let _ = fanout.send((id, Bytes::from(data)));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping client {id} after malformed frame: {e}");
                    return;
                }
            }
        }
    }
}

async fn forward_to_client(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut frames: broadcast::Receiver<Outbound>,
) {
    loop {
        match frames.recv().await {
            Ok((from, _)) if from == id => continue,
            Ok((_, data)) => {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("Write error to client {id}: {e}");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Client {id} fell behind, {skipped} frames skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
