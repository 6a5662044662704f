use fear_core::framing::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Socket is already open")]
    SocketAlreadyOpen,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, SocketError>;
