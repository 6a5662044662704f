pub mod error;
pub mod frame_socket;

pub use error::{Result, SocketError};
pub use frame_socket::{FrameSocket, SocketEvent};
