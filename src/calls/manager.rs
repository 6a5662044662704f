//! Call signaling over the control channel.
//!
//! The manager owns the single call a session can have. It reacts to call
//! signals received on the control channel, drives the [`CallState`]
//! machine, and starts and stops the [`AudioTransport`] carrying the voice.

use async_trait::async_trait;
use fear_core::calls::{
    CallRequest, CallResponse, CallSession, CallState, CallTransition, EndReason, Signal, UdpInfo,
};
use fear_core::crypto::SessionKey;
use fear_core::media::{MediaBackend, NoncePrefix};
use log::{debug, error, info, trace, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::direct::{self, DirectDial};
use super::error::CallError;
use crate::media::{
    AudioTransport, AudioTransportConfig, MediaEvent, MediaStats, TransportParams,
};
use crate::types::events::{CallEnded, CallFailed, CallStarted, EventBus, IncomingCall};

/// Outbound half of the control channel, as seen by the call manager.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send_signal(&self, signal: &Signal) -> Result<(), CallError>;
}

#[derive(Debug, Clone)]
pub struct CallContext {
    pub room: String,
    pub local_name: String,
    pub key: SessionKey,
    /// Preferred local UDP port for accepted calls.
    pub udp_port: Option<u16>,
    pub transport: AudioTransportConfig,
    /// How long an accepted call may wait for the caller's first HELLO.
    pub negotiation_timeout: Duration,
}

impl CallContext {
    pub fn new(room: &str, local_name: &str, key: SessionKey) -> Self {
        Self {
            room: room.to_owned(),
            local_name: local_name.to_owned(),
            key,
            udp_port: None,
            transport: AudioTransportConfig::default(),
            negotiation_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: CallState,
    session: Option<CallSession>,
    transport: Option<AudioTransport>,
    /// Prefix the callee announced in UDP_INFO; the HELLO is authoritative.
    advertised_prefix: Option<NoncePrefix>,
    /// Direct-dial calls have no signaling peer.
    direct: bool,
    /// Bumped whenever a transport is started or torn down, so events from
    /// an old transport are ignored.
    generation: u64,
}

pub struct CallManager {
    ctx: CallContext,
    signaling: Arc<dyn SignalingSink>,
    backend: Arc<dyn MediaBackend>,
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl CallManager {
    pub fn new(
        ctx: CallContext,
        signaling: Arc<dyn SignalingSink>,
        backend: Arc<dyn MediaBackend>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            signaling,
            backend,
            events,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state.clone()
    }

    /// Snapshot of the current call's media parameters.
    pub async fn session(&self) -> Option<CallSession> {
        let inner = self.inner.lock().await;
        let mut session = inner.session.clone()?;
        if let Some(transport) = &inner.transport {
            if let Some(prefix) = transport.remote_prefix().await {
                session.remote_nonce_prefix = Some(prefix);
            }
            session.remote_prefix_ready = transport.is_remote_ready();
            session.tx_seq = transport.tx_seq();
        }
        Some(session)
    }

    pub async fn media_stats(&self) -> Option<MediaStats> {
        self.inner.lock().await.transport.as_ref().map(|t| t.stats())
    }

    pub async fn local_media_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .await
            .transport
            .as_ref()
            .map(|t| t.local_addr())
    }

    fn response(&self, to: &str, accepted: bool) -> CallResponse {
        CallResponse::new(&self.ctx.room, &self.ctx.local_name, to, accepted)
    }

    async fn send_best_effort(&self, signal: Signal) {
        if let Err(e) = self.signaling.send_signal(&signal).await {
            warn!("Failed to send {:?}: {e}", signal.message_type());
        }
    }

    fn emit_failed(&self, peer: Option<&str>, message: String) {
        let _ = self.events.call_failed.send(Arc::new(CallFailed {
            peer: peer.map(str::to_owned),
            message,
        }));
    }

    /// Sends a call request to `target`.
    pub async fn request_call(&self, target: &str) -> Result<(), CallError> {
        if target == self.ctx.local_name {
            return Err(CallError::SelfCall);
        }
        let mut inner = self.inner.lock().await;
        let next = inner.state.next(CallTransition::RequestSent {
            to: target.to_owned(),
        })?;
        let request = CallRequest::new(&self.ctx.room, &self.ctx.local_name, target);
        self.signaling.send_signal(&Signal::Request(request)).await?;
        info!("Calling {target}");
        inner.state = next;
        Ok(())
    }

    /// Accepts the ringing call: opens the media endpoint and tells the
    /// caller where to send.
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let next = inner.state.next(CallTransition::LocalAccepted)?;
        let caller = inner
            .state
            .peer()
            .map(str::to_owned)
            .ok_or(CallError::NoActiveCall)?;

        let params = TransportParams {
            key: self.ctx.key.clone(),
            remote: None,
            local_port: self.ctx.udp_port,
            is_initiator: false,
        };
        let started =
            AudioTransport::start(params, self.ctx.transport.clone(), self.backend.as_ref()).await;
        let (transport, media_events) = match started {
            Ok(started) => started,
            Err(e) => {
                error!("Could not start audio for call from {caller}: {e}");
                self.send_best_effort(Signal::Reject(self.response(&caller, false)))
                    .await;
                inner.state = CallState::Idle;
                self.emit_failed(Some(&caller), e.to_string());
                return Err(e.into());
            }
        };

        let port = transport.local_addr().port();
        let prefix = transport.local_prefix();
        let sent: Result<(), CallError> = async {
            self.signaling
                .send_signal(&Signal::Accept(self.response(&caller, true)))
                .await?;
            let info = UdpInfo::new(&self.ctx.room, &self.ctx.local_name, port, prefix);
            self.signaling.send_signal(&Signal::UdpInfo(info)).await
        }
        .await;
        if let Err(e) = sent {
            transport.stop().await;
            inner.state = CallState::Idle;
            return Err(e);
        }

        inner.generation += 1;
        inner.state = next;
        inner.session = Some(CallSession::new(
            &self.ctx.room,
            &self.ctx.local_name,
            &caller,
            false,
            prefix,
        ));
        inner.transport = Some(transport);
        self.watch_media(inner.generation, media_events);
        self.arm_negotiation_timeout(inner.generation);
        info!("Accepted call from {caller}, media on UDP port {port}");
        Ok(())
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let next = inner.state.next(CallTransition::LocalRejected)?;
        if let Some(caller) = inner.state.peer().map(str::to_owned) {
            self.send_best_effort(Signal::Reject(self.response(&caller, false)))
                .await;
            info!("Rejected call from {caller}");
        }
        inner.state = next;
        Ok(())
    }

    /// Ends the current call in any state, telling the peer.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_idle() {
            return Err(CallError::NoActiveCall);
        }
        if !inner.direct {
            let end = CallRequest::end(&self.ctx.room, &self.ctx.local_name);
            self.send_best_effort(Signal::End(end)).await;
        }
        self.teardown(&mut inner, EndReason::LocalHangup).await;
        Ok(())
    }

    /// Starts a direct-dial call, replacing any call in progress.
    pub async fn start_direct(self: &Arc<Self>, target: &DirectDial) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_idle() {
            info!("Replacing the current call with a direct dial");
            self.teardown(&mut inner, EndReason::LocalHangup).await;
        }

        let peer = format!("{}:{}", target.host, target.port);
        let (transport, media_events) =
            match direct::dial(target, self.ctx.transport.clone(), self.backend.as_ref()).await {
                Ok(started) => started,
                Err(e) => {
                    self.emit_failed(Some(&peer), e.to_string());
                    return Err(e);
                }
            };
        inner.state = inner
            .state
            .next(CallTransition::DirectDialed { peer: peer.clone() })?;
        inner.generation += 1;
        inner.direct = true;
        inner.session = Some(CallSession::new(
            &self.ctx.room,
            &self.ctx.local_name,
            &peer,
            true,
            transport.local_prefix(),
        ));
        let remote_addr = transport.remote_addr().await;
        inner.transport = Some(transport);
        self.watch_media(inner.generation, media_events);
        let _ = self.events.call_started.send(Arc::new(CallStarted {
            peer,
            is_initiator: true,
            remote_addr,
        }));
        Ok(())
    }

    /// Dispatches a call signal received from `sender`, the authenticated
    /// frame sender. `server_ip` is the control server's address, where the
    /// callee's advertised UDP port is reachable.
    pub async fn handle_signal(self: &Arc<Self>, sender: &str, signal: Signal, server_ip: IpAddr) {
        let result = match signal {
            Signal::Request(req) => self.on_request(sender, req).await,
            Signal::Accept(resp) => self.on_accept(sender, resp).await,
            Signal::Reject(resp) => self.on_reject(sender, resp).await,
            Signal::End(req) => self.on_end(sender, req).await,
            Signal::UdpInfo(info) => self.on_udp_info(sender, info, server_ip).await,
        };
        if let Err(e) = result {
            warn!("Failed to handle call signal from {sender}: {e}");
        }
    }

    /// The control channel is gone: a signaled call cannot continue.
    pub async fn on_control_disconnected(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_idle() && !inner.direct {
            self.teardown(&mut inner, EndReason::ControlDisconnected).await;
        }
    }

    async fn on_request(&self, sender: &str, req: CallRequest) -> Result<(), CallError> {
        if req.to_user != self.ctx.local_name {
            trace!("Call request from {sender} is for {}", req.to_user);
            return Ok(());
        }
        if req.from_user != sender {
            warn!("Ignoring call request from {sender} claiming to be {}", req.from_user);
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if inner.state.peer() == Some(sender) {
            debug!("Duplicate call request from {sender}");
            return Ok(());
        }
        match inner.state.next(CallTransition::RequestReceived {
            from: sender.to_owned(),
        }) {
            Ok(next) => {
                inner.state = next;
                info!("Incoming call from {sender}");
                let _ = self.events.incoming_call.send(Arc::new(IncomingCall {
                    room: req.room,
                    from: sender.to_owned(),
                }));
            }
            Err(_) => {
                info!("Busy ({}), rejecting call from {sender}", inner.state.name());
                self.send_best_effort(Signal::Reject(self.response(sender, false)))
                    .await;
            }
        }
        Ok(())
    }

    async fn on_accept(&self, sender: &str, resp: CallResponse) -> Result<(), CallError> {
        if resp.to_user != self.ctx.local_name || !resp.accepted || resp.from_user != sender {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if !matches!(&inner.state, CallState::Requesting { target, .. } if target == sender) {
            debug!("Unexpected accept from {sender} in state {}", inner.state.name());
            return Ok(());
        }
        inner.state = inner.state.next(CallTransition::RemoteAccepted)?;
        debug!("{sender} accepted, waiting for its UDP endpoint");
        Ok(())
    }

    async fn on_reject(&self, sender: &str, resp: CallResponse) -> Result<(), CallError> {
        if resp.to_user != self.ctx.local_name || resp.accepted || resp.from_user != sender {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if !matches!(&inner.state, CallState::Requesting { target, .. } if target == sender) {
            return Ok(());
        }
        inner.state = inner.state.next(CallTransition::RemoteRejected)?;
        info!("{sender} rejected the call");
        self.emit_failed(Some(sender), "call rejected".into());
        Ok(())
    }

    async fn on_end(&self, sender: &str, _req: CallRequest) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_idle() || inner.direct {
            return Ok(());
        }
        if inner.state.peer() != Some(sender) {
            debug!("Ignoring END from {sender}, not part of this call");
            return Ok(());
        }
        self.teardown(&mut inner, EndReason::RemoteHangup).await;
        Ok(())
    }

    async fn on_udp_info(
        self: &Arc<Self>,
        sender: &str,
        info: UdpInfo,
        server_ip: IpAddr,
    ) -> Result<(), CallError> {
        if info.user == self.ctx.local_name || info.user != sender {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if !matches!(&inner.state, CallState::Requesting { target, .. } if target == sender) {
            debug!("Ignoring UDP info from {sender} in state {}", inner.state.name());
            return Ok(());
        }
        let next = inner.state.next(CallTransition::UdpInfoReceived)?;

        let remote = SocketAddr::new(server_ip, info.udp_port);
        let params = TransportParams {
            key: self.ctx.key.clone(),
            remote: Some(remote),
            local_port: self.ctx.udp_port,
            is_initiator: true,
        };
        let started =
            AudioTransport::start(params, self.ctx.transport.clone(), self.backend.as_ref()).await;
        let (transport, media_events) = match started {
            Ok(started) => started,
            Err(e) => {
                error!("Could not start audio toward {remote}: {e}");
                let end = CallRequest::end(&self.ctx.room, &self.ctx.local_name);
                self.send_best_effort(Signal::End(end)).await;
                inner.state = CallState::Idle;
                self.emit_failed(Some(sender), e.to_string());
                return Err(e.into());
            }
        };

        inner.generation += 1;
        inner.state = next;
        inner.advertised_prefix = Some(info.nonce_prefix);
        inner.session = Some(CallSession::new(
            &self.ctx.room,
            &self.ctx.local_name,
            sender,
            true,
            transport.local_prefix(),
        ));
        inner.transport = Some(transport);
        self.watch_media(inner.generation, media_events);
        info!("Call with {sender} active, media to {remote}");
        let _ = self.events.call_started.send(Arc::new(CallStarted {
            peer: sender.to_owned(),
            is_initiator: true,
            remote_addr: Some(remote),
        }));
        Ok(())
    }

    async fn on_media_event(&self, generation: u64, event: MediaEvent) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        match event {
            MediaEvent::PeerReady { addr, prefix } => {
                if inner.advertised_prefix.is_some_and(|p| p != prefix) {
                    warn!("HELLO prefix from {addr} differs from the advertised one");
                }
                if let Some(session) = inner.session.as_mut() {
                    session.remote_nonce_prefix = Some(prefix);
                    session.remote_prefix_ready = true;
                }
                if !matches!(inner.state, CallState::Negotiating { .. }) {
                    debug!("Media path to {addr} is up");
                    return;
                }
                match inner.state.next(CallTransition::MediaReady) {
                    Ok(next) => {
                        let peer = next.peer().unwrap_or_default().to_owned();
                        inner.state = next;
                        info!("Call with {peer} active, media from {addr}");
                        let _ = self.events.call_started.send(Arc::new(CallStarted {
                            peer,
                            is_initiator: false,
                            remote_addr: Some(addr),
                        }));
                    }
                    Err(e) => warn!("{e}"),
                }
            }
            MediaEvent::PeerSwitched { addr, prefix } => {
                info!("Media peer switched to {addr}");
                if let Some(session) = inner.session.as_mut() {
                    session.remote_nonce_prefix = Some(prefix);
                }
            }
            MediaEvent::Failed(reason) => {
                error!("Call media failed: {reason}");
                if !inner.direct {
                    let end = CallRequest::end(&self.ctx.room, &self.ctx.local_name);
                    self.send_best_effort(Signal::End(end)).await;
                }
                self.teardown(&mut inner, EndReason::TransportError).await;
            }
            MediaEvent::Stopped => {}
        }
    }

    fn watch_media(self: &Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_media_event(generation, event).await;
            }
        });
    }

    fn arm_negotiation_timeout(self: &Arc<Self>, generation: u64) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let timeout = self.ctx.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let mut inner = manager.inner.lock().await;
            if inner.generation == generation && matches!(inner.state, CallState::Negotiating { .. })
            {
                warn!("No HELLO from the caller within {timeout:?}");
                let end = CallRequest::end(&manager.ctx.room, &manager.ctx.local_name);
                manager.send_best_effort(Signal::End(end)).await;
                manager.teardown(&mut inner, EndReason::TransportError).await;
            }
        });
    }

    async fn teardown(&self, inner: &mut Inner, reason: EndReason) {
        let peer = inner.state.peer().map(str::to_owned);
        if let Some(transport) = inner.transport.take() {
            transport.stop().await;
        }
        inner.state = inner
            .state
            .next(CallTransition::Ended { reason })
            .unwrap_or_default();
        inner.session = None;
        inner.advertised_prefix = None;
        inner.direct = false;
        inner.generation += 1;
        info!("Call with {} ended ({reason:?})", peer.as_deref().unwrap_or("nobody"));
        let _ = self
            .events
            .call_ended
            .send(Arc::new(CallEnded { peer, reason }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::HeadlessBackend;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<Signal>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Signal> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl SignalingSink for RecordingSink {
        async fn send_signal(&self, signal: &Signal) -> Result<(), CallError> {
            self.sent.lock().unwrap().push(signal.clone());
            Ok(())
        }
    }

    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn manager_with(
        name: &str,
        backend: HeadlessBackend,
        negotiation_timeout: Duration,
    ) -> (Arc<CallManager>, Arc<RecordingSink>, Arc<EventBus>) {
        let mut ctx = CallContext::new("r1", name, SessionKey::from_slice(&[9; 32]).unwrap());
        ctx.negotiation_timeout = negotiation_timeout;
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventBus::new());
        let manager = CallManager::new(ctx, sink.clone(), Arc::new(backend), events.clone());
        (manager, sink, events)
    }

    fn manager(name: &str) -> (Arc<CallManager>, Arc<RecordingSink>, Arc<EventBus>) {
        manager_with(name, HeadlessBackend::default(), Duration::from_secs(15))
    }

    fn request(from: &str, to: &str) -> Signal {
        Signal::Request(CallRequest::new("r1", from, to))
    }

    #[tokio::test]
    async fn test_request_then_remote_reject() {
        let (alice, sink, events) = manager("alice");
        let mut failed = events.call_failed.subscribe();

        alice.request_call("bob").await.unwrap();
        assert!(matches!(sink.take().as_slice(), [Signal::Request(r)] if r.to_user == "bob"));

        let reject = Signal::Reject(CallResponse::new("r1", "bob", "alice", false));
        alice.handle_signal("bob", reject, SERVER).await;
        assert!(alice.state().await.is_idle());
        assert_eq!(failed.recv().await.unwrap().peer.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_second_request_is_refused_locally() {
        let (alice, _sink, _events) = manager("alice");
        alice.request_call("bob").await.unwrap();
        assert!(matches!(
            alice.request_call("carol").await,
            Err(CallError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_callee_rejects_and_ignores_duplicates() {
        let (bob, sink, events) = manager("bob");
        let mut incoming = events.incoming_call.subscribe();

        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        assert_eq!(incoming.recv().await.unwrap().from, "alice");
        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        assert!(sink.take().is_empty());

        bob.handle_signal("carol", request("carol", "bob"), SERVER).await;
        match sink.take().as_slice() {
            [Signal::Reject(r)] => {
                assert_eq!(r.to_user, "carol");
                assert!(!r.accepted);
            }
            other => panic!("unexpected signals {other:?}"),
        }
        assert!(bob.state().await.can_accept());
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_ignored() {
        let (bob, sink, _events) = manager("bob");
        bob.handle_signal("mallory", request("alice", "bob"), SERVER).await;
        assert!(bob.state().await.is_idle());
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_accept_sends_endpoint_and_hang_up_ends() {
        let (bob, sink, events) = manager("bob");
        let mut ended = events.call_ended.subscribe();

        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        bob.accept().await.unwrap();
        assert!(matches!(bob.state().await, CallState::Negotiating { .. }));

        let local = bob.local_media_addr().await.unwrap();
        let session = bob.session().await.unwrap();
        match sink.take().as_slice() {
            [Signal::Accept(a), Signal::UdpInfo(info)] => {
                assert!(a.accepted);
                assert_eq!(a.to_user, "alice");
                assert_eq!(info.user, "bob");
                assert_eq!(info.udp_port, local.port());
                assert_eq!(info.nonce_prefix, session.local_nonce_prefix);
            }
            other => panic!("unexpected signals {other:?}"),
        }
        assert!(!session.is_initiator);

        bob.hang_up().await.unwrap();
        assert!(matches!(sink.take().as_slice(), [Signal::End(_)]));
        let event = ended.recv().await.unwrap();
        assert_eq!(event.reason, EndReason::LocalHangup);
        assert!(bob.state().await.is_idle());
        assert!(bob.local_media_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_device_failure_on_accept_rejects() {
        let backend = HeadlessBackend::default().fail_playback();
        let (bob, sink, events) = manager_with("bob", backend.clone(), Duration::from_secs(15));
        let mut failed = events.call_failed.subscribe();

        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        assert!(matches!(bob.accept().await, Err(CallError::Media(_))));
        assert!(matches!(sink.take().as_slice(), [Signal::Reject(_)]));
        assert!(bob.state().await.is_idle());
        assert_eq!(failed.recv().await.unwrap().peer.as_deref(), Some("alice"));
        // The capture device opened before playback failed is released.
        assert_eq!(backend.released_devices(), 1);
    }

    #[tokio::test]
    async fn test_end_from_stranger_is_ignored() {
        let (bob, _sink, _events) = manager("bob");
        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        let end = Signal::End(CallRequest::end("r1", "carol"));
        bob.handle_signal("carol", end, SERVER).await;
        assert!(bob.state().await.can_accept());

        let end = Signal::End(CallRequest::end("r1", "alice"));
        bob.handle_signal("alice", end, SERVER).await;
        assert!(bob.state().await.is_idle());
    }

    #[tokio::test]
    async fn test_negotiation_times_out_without_hello() {
        let (bob, sink, events) =
            manager_with("bob", HeadlessBackend::default(), Duration::from_millis(100));
        let mut ended = events.call_ended.subscribe();

        bob.handle_signal("alice", request("alice", "bob"), SERVER).await;
        bob.accept().await.unwrap();
        sink.take();

        let event = tokio::time::timeout(Duration::from_secs(2), ended.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, EndReason::TransportError);
        assert!(matches!(sink.take().as_slice(), [Signal::End(_)]));
        assert!(bob.state().await.is_idle());
    }

    #[tokio::test]
    async fn test_hang_up_when_idle_fails() {
        let (alice, _sink, _events) = manager("alice");
        assert!(matches!(alice.hang_up().await, Err(CallError::NoActiveCall)));
        assert!(matches!(alice.request_call("alice").await, Err(CallError::SelfCall)));
    }
}
