mod common;

use common::{join, next_event, no_event, settle, start_relay};
use fear::crypto::SessionKey;
use fear::framing::encode_frame;
use fear::protocol::MessageType;
use fear::{SessionError, SessionState};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn text_reaches_room_members_only() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay().await;
    let key = SessionKey::generate();

    let alice = join(relay, "r1", "alice", &key, dir.path()).await;
    let bob = join(relay, "r1", "bob", &key, dir.path()).await;
    let carol = join(relay, "r2", "carol", &key, dir.path()).await;
    let mut bob_chat = bob.events().chat_message.subscribe();
    let mut carol_chat = carol.events().chat_message.subscribe();
    let mut alice_chat = alice.events().chat_message.subscribe();
    settle().await;

    alice.send_text("hi").await.unwrap();

    let msg = next_event(&mut bob_chat).await;
    assert_eq!(msg.room, "r1");
    assert_eq!(msg.sender, "alice");
    assert_eq!(msg.content, "hi");
    assert!(!msg.is_local);

    let echo = next_event(&mut alice_chat).await;
    assert!(echo.is_local);
    assert_eq!(echo.content, "hi");

    no_event(&mut carol_chat, Duration::from_millis(300)).await;
    // Alice never sees her own frame come back from the network.
    no_event(&mut alice_chat, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn frames_under_another_key_are_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay().await;
    let key = SessionKey::generate();

    let bob = join(relay, "r1", "bob", &key, dir.path()).await;
    let alice = join(relay, "r1", "alice", &key, dir.path()).await;
    let mut bob_chat = bob.events().chat_message.subscribe();
    let mut bob_errors = bob.events().error.subscribe();

    let mut mallory = TcpStream::connect(relay).await.unwrap();
    settle().await;
    let forged = encode_frame("r1", "alice", MessageType::Text, b"forged", &SessionKey::generate()).unwrap();
    mallory.write_all(&forged).await.unwrap();

    alice.send_text("real").await.unwrap();
    let msg = next_event(&mut bob_chat).await;
    assert_eq!(msg.content, "real");
    no_event(&mut bob_errors, Duration::from_millis(100)).await;
    assert_eq!(bob.state().await, SessionState::Connected);
}

#[tokio::test]
async fn unknown_message_types_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay().await;
    let key = SessionKey::generate();

    let alice = join(relay, "r1", "alice", &key, dir.path()).await;
    let bob = join(relay, "r1", "bob", &key, dir.path()).await;
    let mut bob_chat = bob.events().chat_message.subscribe();
    settle().await;

    alice.send(MessageType::Unknown(42), b"future").await.unwrap();
    alice.send_text("after").await.unwrap();
    assert_eq!(next_event(&mut bob_chat).await.content, "after");
}

#[tokio::test]
async fn sending_before_connect_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = fear::ClientConfig {
        host: "127.0.0.1".into(),
        port: 1,
        room: "r1".into(),
        name: "alice".into(),
        key: SessionKey::generate().to_base64(),
        download_dir: Some(dir.path().to_path_buf()),
        udp_port: None,
    }
    .validate()
    .unwrap();
    let session = fear::ControlSession::new(
        config,
        std::sync::Arc::new(fear::media::HeadlessBackend::default()),
    );
    assert!(matches!(
        session.send_text("hi").await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test]
async fn malformed_stream_disconnects_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let key = SessionKey::generate();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // roomLen 257 is over the limit.
        stream.write_all(&257u16.to_le_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let session = {
        let config = fear::ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            room: "r1".into(),
            name: "bob".into(),
            key: key.to_base64(),
            download_dir: Some(dir.path().to_path_buf()),
            udp_port: None,
        }
        .validate()
        .unwrap();
        fear::ControlSession::new(
            config,
            std::sync::Arc::new(fear::media::HeadlessBackend::default()),
        )
    };
    let mut errors = session.events().error.subscribe();
    let mut disconnected = session.events().disconnected.subscribe();
    session.connect().await.unwrap();

    next_event(&mut errors).await;
    next_event(&mut disconnected).await;
    assert_eq!(session.state().await, SessionState::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn write_half_is_released_after_the_peer_hangs_up() {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, writer) = stream.into_split();
        drop(writer);
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(5), reader.read(&mut buf)).await
    });

    let config = fear::ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        room: "r1".into(),
        name: "bob".into(),
        key: SessionKey::generate().to_base64(),
        download_dir: Some(dir.path().to_path_buf()),
        udp_port: None,
    }
    .validate()
    .unwrap();
    let session = fear::ControlSession::new(
        config,
        std::sync::Arc::new(fear::media::HeadlessBackend::default()),
    );
    let mut disconnected = session.events().disconnected.subscribe();
    session.connect().await.unwrap();

    next_event(&mut disconnected).await;
    assert_eq!(session.state().await, SessionState::Disconnected);
    session.disconnect().await;
    session.disconnect().await;

    let read = server.await.unwrap();
    assert!(
        matches!(read, Ok(Ok(0))),
        "server should see our write half closed, got {read:?}"
    );
    assert!(matches!(
        session.send_text("late").await,
        Err(SessionError::NotConnected)
    ));
}
