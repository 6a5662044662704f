use fear::crypto::SessionKey;
use fear::media::{AudioTransport, AudioTransportConfig, HeadlessBackend, MediaEvent, TransportParams};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

async fn responder(key: &SessionKey, backend: &HeadlessBackend) -> (AudioTransport, UnboundedReceiver<MediaEvent>) {
    let params = TransportParams {
        key: key.clone(),
        remote: None,
        local_port: None,
        is_initiator: false,
    };
    AudioTransport::start(params, AudioTransportConfig::default(), backend)
        .await
        .unwrap()
}

async fn initiator(
    key: &SessionKey,
    remote: SocketAddr,
    backend: &HeadlessBackend,
) -> (AudioTransport, UnboundedReceiver<MediaEvent>) {
    let params = TransportParams {
        key: key.clone(),
        remote: Some(remote),
        local_port: None,
        is_initiator: true,
    };
    AudioTransport::start(params, AudioTransportConfig::default(), backend)
        .await
        .unwrap()
}

async fn wait_ready(events: &mut UnboundedReceiver<MediaEvent>) -> SocketAddr {
    // 100 attempts at 50 ms is the whole retry window.
    let event = timeout(Duration::from_secs(6), events.recv())
        .await
        .expect("no HELLO within the retry window")
        .expect("transport stopped");
    match event {
        MediaEvent::PeerReady { addr, .. } => addr,
        other => panic!("expected PeerReady, got {other:?}"),
    }
}

#[tokio::test]
async fn hello_converges_and_audio_flows() {
    let key = SessionKey::generate();
    let callee_backend = HeadlessBackend::default();
    let caller_backend = HeadlessBackend::default();

    let (callee, mut callee_events) = responder(&key, &callee_backend).await;
    let (caller, mut caller_events) =
        initiator(&key, loopback(callee.local_addr()), &caller_backend).await;

    let seen_by_callee = wait_ready(&mut callee_events).await;
    assert_eq!(seen_by_callee.port(), caller.local_addr().port());
    wait_ready(&mut caller_events).await;

    assert_eq!(callee.remote_prefix().await, Some(caller.local_prefix()));
    assert_eq!(caller.remote_prefix().await, Some(callee.local_prefix()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let caller_stats = caller.stats();
    let callee_stats = callee.stats();
    assert!(caller_stats.packets_sent > 0);
    assert!(callee_stats.packets_received > 0);
    assert!(caller_stats.packets_received > 0);
    assert_eq!(callee_stats.decrypt_failures, 0);
    assert!(callee_backend.frames_played() > 0);

    caller.stop().await;
    callee.stop().await;
    assert_eq!(caller_backend.released_devices(), 2);
    assert_eq!(callee_backend.released_devices(), 2);
}

#[tokio::test]
async fn audio_under_a_different_key_is_rejected() {
    let callee_backend = HeadlessBackend::default();
    let caller_backend = HeadlessBackend::default();
    let (callee, mut callee_events) = responder(&SessionKey::generate(), &callee_backend).await;
    let (caller, mut caller_events) = initiator(
        &SessionKey::generate(),
        loopback(callee.local_addr()),
        &caller_backend,
    )
    .await;

    wait_ready(&mut callee_events).await;
    wait_ready(&mut caller_events).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = callee.stats();
    assert!(stats.decrypt_failures > 0);
    assert_eq!(stats.packets_received, 0);
    assert_eq!(callee_backend.frames_played(), 0);

    caller.stop().await;
    callee.stop().await;
}

/// Forwards datagrams between one client and `target`, dropping every
/// `drop_every`th packet in each direction.
async fn lossy_proxy(target: SocketAddr, drop_every: u64) -> (SocketAddr, Arc<AtomicU64>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_count = dropped.clone();

    tokio::spawn(async move {
        let mut client: Option<SocketAddr> = None;
        let mut counts = [0u64; 2];
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let (direction, to) = if from == target {
                match client {
                    Some(client) => (1, client),
                    None => continue,
                }
            } else {
                client = Some(from);
                (0, target)
            };
            counts[direction] += 1;
            if counts[direction] % drop_every == 1 {
                dropped_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let _ = socket.send_to(&buf[..n], to).await;
        }
    });
    (addr, dropped)
}

#[tokio::test]
async fn hello_converges_through_a_lossy_path() {
    let key = SessionKey::generate();
    let callee_backend = HeadlessBackend::default();
    let caller_backend = HeadlessBackend::default();

    let (callee, mut callee_events) = responder(&key, &callee_backend).await;
    // Drops the first packet each way, then every other one.
    let (proxy, dropped) = lossy_proxy(loopback(callee.local_addr()), 2).await;
    let (caller, mut caller_events) = initiator(&key, proxy, &caller_backend).await;

    let seen_by_callee = wait_ready(&mut callee_events).await;
    assert_eq!(seen_by_callee, proxy);
    wait_ready(&mut caller_events).await;
    assert!(dropped.load(Ordering::Relaxed) >= 2);
    assert!(caller.stats().hellos_sent >= 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(callee.stats().packets_received > 0);

    caller.stop().await;
    callee.stop().await;
}
