// Protocol types live in fear-core; re-exported so callers need one dependency.
pub use fear_core::calls::{CallSession, CallState, EndReason, Signal};
pub use fear_core::{crypto, framing, protocol};

pub mod types {
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod media;
pub mod relay;
pub mod session;
pub mod socket;
pub mod transfer;

pub use config::{ClientConfig, DirectDialConfig, SessionConfig};
pub use relay::Relay;
pub use session::{ControlSession, SessionError, SessionState};
