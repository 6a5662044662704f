//! Call-related error types.

use thiserror::Error;

use crate::media::MediaError;
use fear_core::calls::{InvalidTransition, SignalingError};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no call in progress")]
    NoActiveCall,

    #[error("cannot call yourself")]
    SelfCall,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("failed to send signal: {0}")]
    Send(String),

    #[error("could not resolve {0}")]
    Resolve(String),
}
