//! Control session: one TCP connection to the relay, joined to one room.
//!
//! The receive loop decodes frames, drops those for other rooms or from
//! ourselves, authenticates and decrypts the rest, and dispatches them to
//! chat, file transfer or call signaling. Frames that fail authentication
//! are dropped without disconnecting; a structurally malformed frame ends
//! the session.

use async_trait::async_trait;
use chrono::Utc;
use fear_core::calls::Signal;
use fear_core::crypto::SessionKey;
use fear_core::framing::{ControlFrame, FrameError, encode_frame};
use fear_core::media::MediaBackend;
use fear_core::protocol::MessageType;
use fear_core::transfer::TransferError;
use log::{debug, error, info, trace, warn};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::calls::{CallContext, CallError, CallManager, SignalingSink};
use crate::config::SessionConfig;
use crate::socket::{FrameSocket, SocketError, SocketEvent};
use crate::transfer::{FileReceiver, ReceiveFailure, ReceiveOutcome, load_outgoing};
use crate::types::events::{
    ChatMessage, Connected, Disconnected, EventBus, FileComplete, FileFailed, FileProgress,
    SessionErrorEvent, TransferDirection,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("file transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("session is not connected")]
    NotConnected,
    #[error("session was already used")]
    AlreadyUsed,
}

/// Incoming file frames queued for the file worker.
const FILE_QUEUE_DEPTH: usize = 64;

struct FileFrame {
    msg_type: MessageType,
    sender: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Encrypts and writes frames for this session's room and name.
#[derive(Clone)]
pub struct ControlSender {
    socket: Arc<FrameSocket>,
    room: Arc<str>,
    name: Arc<str>,
    key: SessionKey,
}

impl ControlSender {
    pub async fn send(&self, msg_type: MessageType, payload: &[u8]) -> Result<(), SessionError> {
        let frame = encode_frame(&self.room, &self.name, msg_type, payload, &self.key)?;
        self.socket.send_frame(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl SignalingSink for ControlSender {
    async fn send_signal(&self, signal: &Signal) -> Result<(), CallError> {
        let payload = signal.to_payload()?;
        self.send(signal.message_type(), &payload)
            .await
            .map_err(|e| CallError::Send(e.to_string()))
    }
}

pub struct ControlSession {
    config: SessionConfig,
    state: RwLock<SessionState>,
    sender: ControlSender,
    socket_events: Mutex<Option<Receiver<SocketEvent>>>,
    events: Arc<EventBus>,
    calls: Arc<CallManager>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Arc<Self> {
        let (socket, socket_events) = FrameSocket::new();
        let sender = ControlSender {
            socket: Arc::new(socket),
            room: Arc::from(config.room.as_str()),
            name: Arc::from(config.name.as_str()),
            key: config.key.clone(),
        };
        let events = Arc::new(EventBus::new());

        let mut call_ctx = CallContext::new(&config.room, &config.name, config.key.clone());
        call_ctx.udp_port = config.udp_port;
        call_ctx.transport = config.transport.clone();
        let calls = CallManager::new(
            call_ctx,
            Arc::new(sender.clone()),
            backend,
            events.clone(),
        );

        Arc::new(Self {
            config,
            state: RwLock::new(SessionState::Disconnected),
            sender,
            socket_events: Mutex::new(Some(socket_events)),
            events,
            calls,
            receive_task: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Connects to the relay and starts the receive loop. A session
    /// connects once; build a new one to reconnect.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let socket_events = self
            .socket_events
            .lock()
            .await
            .take()
            .ok_or(SessionError::AlreadyUsed)?;
        *self.state.write().await = SessionState::Connecting;

        let server = match self
            .sender
            .socket
            .connect(&self.config.host, self.config.port)
            .await
        {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = SessionState::Disconnected;
                return Err(e.into());
            }
        };
        *self.state.write().await = SessionState::Connected;
        info!(
            "Joined room {} as {} via {server}",
            self.config.room, self.config.name
        );

        let handle = tokio::spawn(self.clone().run_receive_loop(socket_events, server.ip()));
        *self.receive_task.lock().await = Some(handle);

        let _ = self.events.connected.send(Arc::new(Connected {
            room: self.config.room.clone(),
            name: self.config.name.clone(),
            server,
        }));
        Ok(())
    }

    /// Sends one message of any type to the room.
    pub async fn send(&self, msg_type: MessageType, payload: &[u8]) -> Result<(), SessionError> {
        if self.state().await != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.sender.send(msg_type, payload).await
    }

    /// Sends a chat message and echoes it locally.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.send(MessageType::Text, text.as_bytes()).await?;
        let _ = self.events.chat_message.send(Arc::new(ChatMessage {
            room: self.config.room.clone(),
            sender: self.config.name.clone(),
            content: text.to_owned(),
            timestamp: Utc::now(),
            is_local: true,
        }));
        Ok(())
    }

    /// Sends a file to the room in verified chunks.
    pub async fn send_file(&self, path: &Path) -> Result<(), SessionError> {
        let result = self.send_file_inner(path).await;
        if let Err(e) = &result {
            let _ = self.events.file_failed.send(Arc::new(FileFailed {
                file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
                direction: TransferDirection::Outgoing,
                message: e.to_string(),
            }));
        }
        result
    }

    async fn send_file_inner(&self, path: &Path) -> Result<(), SessionError> {
        if self.state().await != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let file = load_outgoing(path).await?;
        let file_name = file.start().name.clone();
        let total = file.size();
        info!("Sending {file_name} ({total} bytes)");

        self.sender
            .send(MessageType::FileStart, &file.start_payload()?)
            .await?;
        for (payload, sent) in file.chunk_payloads() {
            self.sender.send(MessageType::FileChunk, &payload).await?;
            let _ = self.events.file_progress.send(Arc::new(FileProgress {
                file_name: file_name.clone(),
                direction: TransferDirection::Outgoing,
                bytes: sent,
                total,
            }));
        }
        self.sender
            .send(MessageType::FileEnd, &file.end_payload())
            .await?;

        let _ = self.events.file_complete.send(Arc::new(FileComplete {
            file_name,
            direction: TransferDirection::Outgoing,
            path: None,
            size: total,
        }));
        Ok(())
    }

    /// Closes the connection and ends any signaled call. Safe to call
    /// after the connection already dropped; the write half is released
    /// either way.
    pub async fn disconnect(&self) {
        if self.state().await != SessionState::Disconnected {
            info!("Disconnecting from room {}", self.config.room);
        }
        self.sender.socket.close().await;
        if let Some(handle) = self.receive_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Runs file reception on the blocking pool so disk writes never hold
    /// up chat or call signaling. Frames are handled in arrival order.
    fn spawn_file_worker(&self) -> (mpsc::Sender<FileFrame>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<FileFrame>(FILE_QUEUE_DEPTH);
        let events = self.events.clone();
        let mut receiver = FileReceiver::new(self.config.download_dir.clone());
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(frame) = rx.blocking_recv() {
                let outcome = receiver.handle(frame.msg_type, &frame.sender, &frame.payload);
                publish_file_outcome(&events, &frame.sender, outcome);
            }
            // Dropping the receiver deletes any partial download.
        });
        (tx, handle)
    }

    async fn run_receive_loop(self: Arc<Self>, mut socket_events: Receiver<SocketEvent>, server_ip: IpAddr) {
        let (files, file_worker) = self.spawn_file_worker();
        let mut reason = String::from("connection closed");
        while let Some(event) = socket_events.recv().await {
            match event {
                SocketEvent::Frame(frame) => self.handle_frame(frame, server_ip, &files).await,
                SocketEvent::Malformed(e) => {
                    error!("Dropping connection after malformed frame: {e}");
                    reason = e.to_string();
                    let _ = self.events.error.send(Arc::new(SessionErrorEvent {
                        message: reason.clone(),
                    }));
                    break;
                }
            }
        }

        // Releases the write half even when the peer hung up first.
        self.sender.socket.close().await;
        drop(files);
        if let Err(e) = file_worker.await {
            warn!("File worker ended abnormally: {e}");
        }

        *self.state.write().await = SessionState::Disconnected;
        self.calls.on_control_disconnected().await;
        info!("Control session for room {} ended: {reason}", self.config.room);
        let _ = self
            .events
            .disconnected
            .send(Arc::new(Disconnected { reason }));
    }

    async fn handle_frame(
        self: &Arc<Self>,
        frame: ControlFrame,
        server_ip: IpAddr,
        files: &mpsc::Sender<FileFrame>,
    ) {
        if frame.room != self.config.room || frame.sender == self.config.name {
            trace!("Skipping frame from {} in room {}", frame.sender, frame.room);
            return;
        }
        let plaintext = match frame.open(&self.config.key) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                debug!("Dropping frame from {} that failed authentication", frame.sender);
                return;
            }
        };

        match frame.msg_type {
            MessageType::Text => {
                let _ = self.events.chat_message.send(Arc::new(ChatMessage {
                    room: frame.room,
                    sender: frame.sender,
                    content: String::from_utf8_lossy(&plaintext).into_owned(),
                    timestamp: Utc::now(),
                    is_local: false,
                }));
            }
            ty if ty.is_file() => {
                let queued = files
                    .send(FileFrame {
                        msg_type: ty,
                        sender: frame.sender,
                        payload: plaintext,
                    })
                    .await;
                if queued.is_err() {
                    warn!("File worker is gone, dropping file frame");
                }
            }
            ty if ty.is_call_signal() => match Signal::parse(ty, &plaintext) {
                Ok(signal) => {
                    self.calls
                        .handle_signal(&frame.sender, signal, server_ip)
                        .await
                }
                Err(e) => warn!("Bad call signal from {}: {e}", frame.sender),
            },
            other => debug!("Skipping message type {} from {}", other.as_u8(), frame.sender),
        }
    }
}

fn publish_file_outcome(
    events: &EventBus,
    sender: &str,
    outcome: Result<ReceiveOutcome, ReceiveFailure>,
) {
    match outcome {
        Ok(ReceiveOutcome::Started { file_name, total }) => {
            let _ = events.file_progress.send(Arc::new(FileProgress {
                file_name,
                direction: TransferDirection::Incoming,
                bytes: 0,
                total,
            }));
        }
        Ok(ReceiveOutcome::Progress {
            file_name,
            progress,
        }) => {
            let _ = events.file_progress.send(Arc::new(FileProgress {
                file_name,
                direction: TransferDirection::Incoming,
                bytes: progress.bytes,
                total: progress.total,
            }));
        }
        Ok(ReceiveOutcome::Completed(done)) => {
            let _ = events.file_complete.send(Arc::new(FileComplete {
                file_name: done.file_name,
                direction: TransferDirection::Incoming,
                path: Some(done.destination),
                size: done.size,
            }));
        }
        Ok(ReceiveOutcome::Ignored) => {}
        Err(failure) => {
            warn!("Incoming file from {sender} failed: {}", failure.error);
            let _ = events.file_failed.send(Arc::new(FileFailed {
                file_name: failure.file_name,
                direction: TransferDirection::Incoming,
                message: failure.error.to_string(),
            }));
        }
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("room", &self.config.room)
            .field("name", &self.config.name)
            .field("server", &format_args!("{}:{}", self.config.host, self.config.port))
            .finish()
    }
}
