#![allow(dead_code)]

use fear::config::ClientConfig;
use fear::crypto::SessionKey;
use fear::media::HeadlessBackend;
use fear::{ControlSession, Relay};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start_relay() -> SocketAddr {
    let relay = Relay::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = relay.local_addr().expect("relay addr");
    tokio::spawn(relay.run());
    addr
}

/// Connects `name` to `room` on the relay, saving downloads under `dir`.
pub async fn join(
    relay: SocketAddr,
    room: &str,
    name: &str,
    key: &SessionKey,
    dir: &Path,
) -> Arc<ControlSession> {
    let config = ClientConfig {
        host: relay.ip().to_string(),
        port: relay.port(),
        room: room.into(),
        name: name.into(),
        key: key.to_base64(),
        download_dir: Some(dir.join(name)),
        udp_port: None,
    }
    .validate()
    .expect("valid config");
    let session = ControlSession::new(config, Arc::new(HeadlessBackend::default()));
    session.connect().await.expect("connect");
    session
}

/// Gives the relay time to register freshly connected clients.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn no_event<T: Clone + std::fmt::Debug>(rx: &mut broadcast::Receiver<T>, wait: Duration) {
    if let Ok(Ok(event)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}
