pub mod signaling;
pub mod state;

pub use signaling::{CallRequest, CallResponse, Signal, SignalingError, UdpInfo};
pub use state::{CallSession, CallState, CallTransition, EndReason, InvalidTransition};
