pub mod direct;
pub mod error;
pub mod manager;

pub use direct::DirectDial;
pub use error::CallError;
pub use manager::{CallContext, CallManager, SignalingSink};
