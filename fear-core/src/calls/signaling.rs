//! JSON payloads carried inside encrypted call-signaling frames.

use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::key::URL_SAFE_LENIENT;
use crate::media::packet::{NONCE_PREFIX_LEN, NoncePrefix};
use crate::protocol::MessageType;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message type {0:?} is not a call signal")]
    NotASignal(MessageType),
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Call request. Also the payload of END, with an empty `to_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub room: String,
    pub from_user: String,
    #[serde(default)]
    pub to_user: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl CallRequest {
    pub fn new(room: &str, from_user: &str, to_user: &str) -> Self {
        Self {
            room: room.to_owned(),
            from_user: from_user.to_owned(),
            to_user: to_user.to_owned(),
            timestamp: now_millis(),
        }
    }

    pub fn end(room: &str, from_user: &str) -> Self {
        Self::new(room, from_user, "")
    }
}

/// Accept or reject answer to a [`CallRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub room: String,
    pub from_user: String,
    pub to_user: String,
    pub accepted: bool,
    #[serde(default)]
    pub timestamp: i64,
}

impl CallResponse {
    pub fn new(room: &str, from_user: &str, to_user: &str, accepted: bool) -> Self {
        Self {
            room: room.to_owned(),
            from_user: from_user.to_owned(),
            to_user: to_user.to_owned(),
            accepted,
            timestamp: now_millis(),
        }
    }
}

/// The callee's media endpoint: UDP port plus its outbound nonce prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpInfo {
    pub room: String,
    pub user: String,
    pub udp_port: u16,
    #[serde(with = "prefix_base64")]
    pub nonce_prefix: NoncePrefix,
    #[serde(default)]
    pub timestamp: i64,
}

impl UdpInfo {
    pub fn new(room: &str, user: &str, udp_port: u16, nonce_prefix: NoncePrefix) -> Self {
        Self {
            room: room.to_owned(),
            user: user.to_owned(),
            udp_port,
            nonce_prefix,
            timestamp: now_millis(),
        }
    }
}

mod prefix_base64 {
    use super::*;
    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(prefix: &NoncePrefix, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_LENIENT.encode(prefix))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NoncePrefix, D::Error> {
        let encoded = String::deserialize(d)?;
        let raw = URL_SAFE_LENIENT
            .decode(encoded.as_bytes())
            .map_err(de::Error::custom)?;
        raw.as_slice().try_into().map_err(|_| {
            de::Error::custom(format!(
                "nonce prefix must be {NONCE_PREFIX_LEN} bytes, got {}",
                raw.len()
            ))
        })
    }
}

/// A decoded call-signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Request(CallRequest),
    Accept(CallResponse),
    Reject(CallResponse),
    End(CallRequest),
    UdpInfo(UdpInfo),
}

impl Signal {
    pub fn parse(msg_type: MessageType, payload: &[u8]) -> Result<Self, SignalingError> {
        Ok(match msg_type {
            MessageType::CallRequest => Self::Request(serde_json::from_slice(payload)?),
            MessageType::CallAccept => Self::Accept(serde_json::from_slice(payload)?),
            MessageType::CallReject => Self::Reject(serde_json::from_slice(payload)?),
            MessageType::CallEnd => Self::End(serde_json::from_slice(payload)?),
            MessageType::UdpInfo => Self::UdpInfo(serde_json::from_slice(payload)?),
            other => return Err(SignalingError::NotASignal(other)),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::CallRequest,
            Self::Accept(_) => MessageType::CallAccept,
            Self::Reject(_) => MessageType::CallReject,
            Self::End(_) => MessageType::CallEnd,
            Self::UdpInfo(_) => MessageType::UdpInfo,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, SignalingError> {
        Ok(match self {
            Self::Request(r) | Self::End(r) => serde_json::to_vec(r)?,
            Self::Accept(r) | Self::Reject(r) => serde_json::to_vec(r)?,
            Self::UdpInfo(info) => serde_json::to_vec(info)?,
        })
    }
}
