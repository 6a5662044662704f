use chrono::{DateTime, Utc};
use fear_core::calls::EndReason;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct Connected {
    pub room: String,
    pub name: String,
    pub server: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct Disconnected {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub room: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Echo of a message this session sent.
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone)]
pub struct FileProgress {
    pub file_name: String,
    pub direction: TransferDirection,
    pub bytes: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct FileComplete {
    pub file_name: String,
    pub direction: TransferDirection,
    /// Where the file was written, for incoming transfers.
    pub path: Option<PathBuf>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FileFailed {
    pub file_name: Option<String>,
    pub direction: TransferDirection,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub room: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct CallStarted {
    pub peer: String,
    pub is_initiator: bool,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct CallEnded {
    pub peer: Option<String>,
    pub reason: EndReason,
}

/// A call attempt that did not get going: rejected, busy or a local failure.
#[derive(Debug, Clone)]
pub struct CallFailed {
    pub peer: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SessionErrorEvent {
    pub message: String,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),
    (error, Arc<SessionErrorEvent>),

    // Chat
    (chat_message, Arc<ChatMessage>),

    // File transfer
    (file_progress, Arc<FileProgress>),
    (file_complete, Arc<FileComplete>),
    (file_failed, Arc<FileFailed>),

    // Calls
    (incoming_call, Arc<IncomingCall>),
    (call_started, Arc<CallStarted>),
    (call_ended, Arc<CallEnded>),
    (call_failed, Arc<CallFailed>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
