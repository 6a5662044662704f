//! Call signaling state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::media::packet::NoncePrefix;

/// Why a call left the active set of states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    TransportError,
    ControlDisconnected,
}

/// Current state of the (single) call of a session.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing: request sent, waiting for the callee's UDP endpoint.
    Requesting {
        target: String,
        requested_at: DateTime<Utc>,
        accepted: bool,
    },
    /// Incoming: waiting for the local user to accept or reject.
    Ringing {
        from: String,
        received_at: DateTime<Utc>,
    },
    /// Incoming call accepted, waiting for the caller's HELLO.
    Negotiating {
        peer: String,
        accepted_at: DateTime<Utc>,
    },
    Active {
        peer: String,
        connected_at: DateTime<Utc>,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// The other party of the call, if any.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Requesting { target, .. } => Some(target),
            Self::Ringing { from, .. } => Some(from),
            Self::Negotiating { peer, .. } | Self::Active { peer, .. } => Some(peer),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting { .. } => "requesting",
            Self::Ringing { .. } => "ringing",
            Self::Negotiating { .. } => "negotiating",
            Self::Active { .. } => "active",
        }
    }

    /// Returns the state reached by applying `transition`, or an error if the
    /// transition is not legal from here.
    pub fn next(&self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let now = Utc::now();
        let next = match (self, transition) {
            (Self::Idle, CallTransition::RequestSent { to }) => Self::Requesting {
                target: to,
                requested_at: now,
                accepted: false,
            },
            (Self::Idle, CallTransition::RequestReceived { from }) => Self::Ringing {
                from,
                received_at: now,
            },
            (Self::Idle, CallTransition::DirectDialed { peer }) => Self::Active {
                peer,
                connected_at: now,
            },
            (
                Self::Requesting {
                    target,
                    requested_at,
                    ..
                },
                CallTransition::RemoteAccepted,
            ) => Self::Requesting {
                target: target.clone(),
                requested_at: *requested_at,
                accepted: true,
            },
            (Self::Requesting { target, .. }, CallTransition::UdpInfoReceived) => Self::Active {
                peer: target.clone(),
                connected_at: now,
            },
            (Self::Requesting { .. }, CallTransition::RemoteRejected) => Self::Idle,
            (Self::Ringing { from, .. }, CallTransition::LocalAccepted) => Self::Negotiating {
                peer: from.clone(),
                accepted_at: now,
            },
            (Self::Ringing { .. }, CallTransition::LocalRejected) => Self::Idle,
            (Self::Negotiating { peer, .. }, CallTransition::MediaReady) => Self::Active {
                peer: peer.clone(),
                connected_at: now,
            },
            (current, CallTransition::Ended { .. }) if !current.is_idle() => Self::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_owned(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        Ok(next)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTransition {
    RequestSent { to: String },
    RequestReceived { from: String },
    RemoteAccepted,
    RemoteRejected,
    UdpInfoReceived,
    LocalAccepted,
    LocalRejected,
    MediaReady,
    DirectDialed { peer: String },
    Ended { reason: EndReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Per-call media parameters. Exists from media start until teardown.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub room: String,
    pub local_name: String,
    pub remote_name: String,
    pub is_initiator: bool,
    pub local_nonce_prefix: NoncePrefix,
    pub remote_nonce_prefix: Option<NoncePrefix>,
    pub remote_prefix_ready: bool,
    pub tx_seq: u64,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        room: &str,
        local_name: &str,
        remote_name: &str,
        is_initiator: bool,
        local_nonce_prefix: NoncePrefix,
    ) -> Self {
        Self {
            room: room.to_owned(),
            local_name: local_name.to_owned(),
            remote_name: remote_name.to_owned(),
            is_initiator,
            local_nonce_prefix,
            remote_nonce_prefix: None,
            remote_prefix_ready: false,
            tx_seq: 0,
            started_at: Utc::now(),
        }
    }
}
