//! Direct dial: a call to a known UDP endpoint with a pre-shared key and no
//! control-channel signaling. The HELLO exchange alone brings it up.

use fear_core::crypto::SessionKey;
use fear_core::media::MediaBackend;
use log::info;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use super::error::CallError;
use crate::media::{AudioTransport, AudioTransportConfig, MediaEvent, TransportParams};

/// A validated direct-dial target.
#[derive(Debug, Clone)]
pub struct DirectDial {
    pub host: String,
    pub port: u16,
    pub local_port: Option<u16>,
    pub key: SessionKey,
}

impl DirectDial {
    pub async fn resolve(&self) -> Result<SocketAddr, CallError> {
        let target = format!("{}:{}", self.host, self.port);
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| CallError::Resolve(format!("{target}: {e}")))?
            .next()
            .ok_or(CallError::Resolve(target))
    }
}

/// Starts an initiator transport toward the dial target.
pub async fn dial(
    target: &DirectDial,
    config: AudioTransportConfig,
    backend: &dyn MediaBackend,
) -> Result<(AudioTransport, mpsc::UnboundedReceiver<MediaEvent>), CallError> {
    let remote = target.resolve().await?;
    info!("Direct dial to {remote}");
    let params = TransportParams {
        key: target.key.clone(),
        remote: Some(remote),
        local_port: target.local_port,
        is_initiator: true,
    };
    Ok(AudioTransport::start(params, config, backend).await?)
}
