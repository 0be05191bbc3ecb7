//! Peer session management: one authenticated full-duplex TCP session per
//! peer, with reconnect, heartbeat, and bounded queues in both directions.
//!
//! Each live session runs two pipelines. Ingress reads length-prefixed
//! frames and hands packets to the node's event channel; if that channel is
//! full the connection is closed rather than buffered without bound. Egress
//! drains a bounded per-session queue (`Qmax`) through a single writer task,
//! which also emits heartbeats; senders see `QueueFull` instead of waiting.
//! A session with no inbound frame for three heartbeat intervals is declared
//! stale and torn down; the dial loop then rejoins with capped exponential
//! backoff.

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{self, CodecError, Frame};
use crate::config::NodeConfig;
use crate::timestamp::UnixMillis;
use crate::types::PeerId;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

mod session_state {
    pub const CONNECTING: u8 = 0;
    pub const OPEN: u8 = 1;
    pub const CLOSING: u8 = 2;
    pub const CLOSED: u8 = 3;

    pub fn name(state: u8) -> &'static str {
        match state {
            CONNECTING => "connecting",
            OPEN => "open",
            CLOSING => "closing",
            _ => "closed",
        }
    }
}

/// What the session layer reports upward: inbound packet frames and session
/// loss. The forwarder consumes these.
#[derive(Debug)]
pub enum SessionEvent {
    Frame { peer: PeerId, frame: Frame },
    Disconnected { peer: PeerId },
}

/// Outcome of a non-blocking send toward a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("egress queue full")]
    QueueFull,
    #[error("peer not connected")]
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to bind peer listener: {0}")]
    Bind(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer authentication failed for {0}")]
    AuthFailed(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("unexpected frame during handshake")]
    UnexpectedFrame,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone)]
struct PeerEntry {
    endpoint: String,
    auth_token: String,
}

struct SessionHandle {
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
    state: Arc<AtomicU8>,
    last_rx: Arc<AtomicI64>,
    last_tx: Arc<AtomicI64>,
    epoch: u64,
}

/// Admin view of one configured peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub id: PeerId,
    pub endpoint: String,
    pub state: &'static str,
    pub last_rx_ms: Option<i64>,
    pub last_tx_ms: Option<i64>,
}

enum CloseReason {
    LocalClose,
    Stale,
    IoError(std::io::Error),
    ProtocolViolation(String),
    InboundOverflow,
    PeerClosed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LocalClose => write!(f, "local_close"),
            CloseReason::Stale => write!(f, "stale"),
            CloseReason::IoError(e) => write!(f, "io_error: {e}"),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol_violation: {e}"),
            CloseReason::InboundOverflow => write!(f, "inbound_overflow"),
            CloseReason::PeerClosed => write!(f, "peer_closed"),
        }
    }
}

/// Maintains at most one live authenticated session per peer.
pub struct PeerSessionManager {
    node_id: String,
    heartbeat: Duration,
    max_egress: usize,
    listen_port: u16,
    peers: DashMap<PeerId, PeerEntry>,
    sessions: DashMap<PeerId, SessionHandle>,
    dialing: DashMap<PeerId, ()>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    next_epoch: AtomicU64,
}

impl PeerSessionManager {
    pub fn new(
        node_id: String,
        listen_port: u16,
        heartbeat: Duration,
        max_egress: usize,
        events_tx: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(PeerSessionManager {
            node_id,
            heartbeat,
            max_egress,
            listen_port,
            peers: DashMap::new(),
            sessions: DashMap::new(),
            dialing: DashMap::new(),
            events_tx,
            cancel,
            tracker: TaskTracker::new(),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn from_config(
        config: &NodeConfig,
        events_tx: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Self::new(
            config.node_id.clone(),
            config.listen_port,
            Duration::from_secs(config.heartbeat_secs.max(1) as u64),
            config.max_egress_queue,
            events_tx,
            cancel,
        );
        for peer in &config.peers {
            manager.add_peer(
                peer.id.clone(),
                peer.endpoint.clone(),
                peer.auth_token.inner().clone(),
            );
        }
        manager
    }

    /// Register a peer for dialing and inbound authentication.
    pub fn add_peer(&self, id: PeerId, endpoint: String, auth_token: String) {
        self.peers.insert(id, PeerEntry { endpoint, auth_token });
    }

    /// Bind the listener and start dialing every configured peer. Returns
    /// the bound address (useful when configured with port 0).
    pub async fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr, SessionError> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(SessionError::Bind)?;
        let addr = listener.local_addr().map_err(SessionError::Bind)?;
        tracing::info!(%addr, "peer listener up");

        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            manager.accept_loop(listener).await;
        });

        let peer_ids: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peer_ids {
            self.connect(&peer);
        }
        Ok(addr)
    }

    /// Begin maintaining an outbound session toward `peer`. Idempotent: a
    /// second call while the dial loop is alive does nothing.
    pub fn connect(self: &Arc<Self>, peer: &PeerId) {
        use dashmap::mapref::entry::Entry;
        match self.dialing.entry(peer.clone()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(());
                let manager = Arc::clone(self);
                let peer = peer.clone();
                self.tracker.spawn(async move {
                    Arc::clone(&manager).dial_loop(peer.clone()).await;
                    manager.dialing.remove(&peer);
                });
            }
        }
    }

    /// Close the current session with `peer` if one exists. The dial loop
    /// will re-establish it; always permitted.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(handle) = self.sessions.get(peer) {
            handle.state.store(session_state::CLOSING, Ordering::Relaxed);
            handle.closed.cancel();
        }
    }

    /// Queue a frame toward a peer without waiting.
    pub fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), SendError> {
        let handle = self.sessions.get(peer).ok_or(SendError::NotConnected)?;
        if handle.state.load(Ordering::Relaxed) != session_state::OPEN {
            return Err(SendError::NotConnected);
        }
        handle.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.state.load(Ordering::Relaxed) == session_state::OPEN)
            .count()
    }

    pub fn configured_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_views(&self) -> Vec<PeerView> {
        self.peers
            .iter()
            .map(|entry| {
                let id = entry.key().clone();
                let session = self.sessions.get(&id);
                let (state, last_rx, last_tx) = match &session {
                    Some(s) => (
                        session_state::name(s.state.load(Ordering::Relaxed)),
                        Some(s.last_rx.load(Ordering::Relaxed)),
                        Some(s.last_tx.load(Ordering::Relaxed)),
                    ),
                    None => (session_state::name(session_state::CLOSED), None, None),
                };
                PeerView {
                    id,
                    endpoint: entry.value().endpoint.clone(),
                    state,
                    last_rx_ms: last_rx,
                    last_tx_ms: last_tx,
                }
            })
            .collect()
    }

    /// Stop all sessions and wait for their tasks.
    pub async fn shutdown(&self) {
        for session in self.sessions.iter() {
            session.closed.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let manager = Arc::clone(&self);
                        self.tracker.spawn(async move {
                            if let Err(e) = manager.handle_inbound(stream).await {
                                tracing::warn!(%remote, error = %e, "inbound session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) -> Result<(), SessionError> {
        let hello = timeout(HANDSHAKE_TIMEOUT, codec::read_frame(&mut stream))
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;
        let Frame::Hello {
            node_id,
            auth_token,
            heartbeat_secs,
        } = hello
        else {
            return Err(SessionError::UnexpectedFrame);
        };

        let peer = PeerId::new(node_id.clone()).map_err(|_| SessionError::UnknownPeer(node_id))?;
        let Some(expected) = self.peers.get(&peer).map(|e| e.auth_token.clone()) else {
            tracing::warn!(peer = %peer, event = "auth_failed", "handshake from unknown peer");
            return Err(SessionError::UnknownPeer(peer.to_string()));
        };
        if !token_matches(&auth_token, &expected) {
            tracing::warn!(peer = %peer, event = "auth_failed", "invalid auth token");
            return Err(SessionError::AuthFailed(peer.to_string()));
        }

        codec::write_frame(
            &mut stream,
            &Frame::HelloAck {
                node_id: self.node_id.clone(),
                heartbeat_secs: self.heartbeat.as_secs() as u16,
            },
        )
        .await?;
        tracing::info!(peer = %peer, direction = "inbound", "session open");
        self.run_session(peer, stream, heartbeat_secs).await;
        Ok(())
    }

    async fn dial_loop(self: Arc<Self>, peer: PeerId) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.dial_once(&peer).await {
                Ok(()) => {
                    // Session ran and ended; rejoin promptly.
                    backoff = BACKOFF_INITIAL;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "dial failed");
                }
            }
            let jittered = jitter(backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CEILING);
        }
    }

    async fn dial_once(self: &Arc<Self>, peer: &PeerId) -> Result<(), SessionError> {
        let entry = self
            .peers
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::UnknownPeer(peer.to_string()))?;

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&entry.endpoint))
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;

        codec::write_frame(
            &mut stream,
            &Frame::Hello {
                node_id: self.node_id.clone(),
                auth_token: entry.auth_token.clone(),
                heartbeat_secs: self.heartbeat.as_secs() as u16,
            },
        )
        .await?;

        let ack = timeout(HANDSHAKE_TIMEOUT, codec::read_frame(&mut stream))
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;
        let Frame::HelloAck {
            node_id,
            heartbeat_secs,
        } = ack
        else {
            return Err(SessionError::UnexpectedFrame);
        };
        if node_id != peer.as_str() {
            return Err(SessionError::AuthFailed(node_id));
        }

        tracing::info!(peer = %peer, direction = "outbound", "session open");
        self.run_session(peer.clone(), stream, heartbeat_secs).await;
        Ok(())
    }

    /// Drive one open session until it closes. Registers the session handle
    /// (displacing any previous one), runs ingress inline, and delegates
    /// egress and heartbeats to a writer task.
    async fn run_session(self: &Arc<Self>, peer: PeerId, stream: TcpStream, remote_heartbeat: u16) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (egress_tx, egress_rx) = mpsc::channel(self.max_egress);
        let closed = self.cancel.child_token();
        let state = Arc::new(AtomicU8::new(session_state::OPEN));
        let now = UnixMillis::try_now().map(|t| t.as_millis()).unwrap_or(0);
        let last_rx = Arc::new(AtomicI64::new(now));
        let last_tx = Arc::new(AtomicI64::new(now));

        let handle = SessionHandle {
            tx: egress_tx,
            closed: closed.clone(),
            state: state.clone(),
            last_rx: last_rx.clone(),
            last_tx: last_tx.clone(),
            epoch,
        };
        if let Some(old) = self.sessions.insert(peer.clone(), handle) {
            tracing::info!(peer = %peer, "displacing previous session");
            old.state.store(session_state::CLOSING, Ordering::Relaxed);
            old.closed.cancel();
        }

        let (rd, wr) = stream.into_split();
        let stale_after = Duration::from_secs(3 * remote_heartbeat.max(1) as u64);

        self.tracker.spawn(Self::egress_loop(
            wr,
            egress_rx,
            closed.clone(),
            self.heartbeat,
            last_tx,
        ));

        let reason = self.ingress_loop(&peer, rd, &closed, stale_after, last_rx).await;
        tracing::info!(peer = %peer, reason = %reason, "session closed");

        state.store(session_state::CLOSED, Ordering::Relaxed);
        closed.cancel();

        // Remove only our own registration; a displacing session stays.
        let removed = self.sessions.remove_if(&peer, |_, h| h.epoch == epoch);
        if removed.is_some() {
            let _ = self
                .events_tx
                .send(SessionEvent::Disconnected { peer })
                .await;
        }
    }

    async fn ingress_loop(
        &self,
        peer: &PeerId,
        mut rd: OwnedReadHalf,
        closed: &CancellationToken,
        stale_after: Duration,
        last_rx: Arc<AtomicI64>,
    ) -> CloseReason {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => return CloseReason::LocalClose,
                read = timeout(stale_after, codec::read_frame(&mut rd)) => match read {
                    Err(_elapsed) => return CloseReason::Stale,
                    Ok(Err(CodecError::Io(e)))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return CloseReason::PeerClosed;
                    }
                    Ok(Err(CodecError::Io(e))) => return CloseReason::IoError(e),
                    Ok(Err(e)) => return CloseReason::ProtocolViolation(e.to_string()),
                    Ok(Ok(frame)) => frame,
                }
            };
            if let Ok(now) = UnixMillis::try_now() {
                last_rx.store(now.as_millis(), Ordering::Relaxed);
            }
            match frame {
                Frame::Heartbeat => {}
                Frame::Hello { .. } | Frame::HelloAck { .. } => {
                    return CloseReason::ProtocolViolation("handshake frame after open".into());
                }
                frame => {
                    let event = SessionEvent::Frame {
                        peer: peer.clone(),
                        frame,
                    };
                    if self.events_tx.try_send(event).is_err() {
                        return CloseReason::InboundOverflow;
                    }
                }
            }
        }
    }

    async fn egress_loop(
        mut wr: OwnedWriteHalf,
        mut egress_rx: mpsc::Receiver<Frame>,
        closed: CancellationToken,
        heartbeat: Duration,
        last_tx: Arc<AtomicI64>,
    ) {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so heartbeats start one
        // interval after the handshake.
        ticker.tick().await;
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => return,
                maybe = egress_rx.recv() => match maybe {
                    Some(frame) => frame,
                    None => return,
                },
                _ = ticker.tick() => Frame::Heartbeat,
            };
            if codec::write_frame(&mut wr, &frame).await.is_err() {
                closed.cancel();
                return;
            }
            if let Ok(now) = UnixMillis::try_now() {
                last_tx.store(now.as_millis(), Ordering::Relaxed);
            }
        }
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 5).max(1);
    let offset = rand::rng().random_range(0..spread);
    base + Duration::from_millis(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PreparePacket, RejectPacket};
    use crate::condition::Condition;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn manager(
        node_id: &str,
        port: u16,
    ) -> (Arc<PeerSessionManager>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let manager = PeerSessionManager::new(
            node_id.to_string(),
            port,
            Duration::from_secs(1),
            16,
            tx,
            CancellationToken::new(),
        );
        (manager, rx)
    }

    async fn wait_open(m: &PeerSessionManager) {
        for _ in 0..100 {
            if m.open_sessions() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session did not open");
    }

    fn sample_prepare() -> Frame {
        Frame::Prepare(PreparePacket {
            amount: 10,
            expires_at: UnixMillis(i64::MAX),
            condition: Condition::from_payload(b"p"),
            destination: "g.x".parse().unwrap(),
            payload: b"p".to_vec(),
        })
    }

    #[tokio::test]
    async fn test_handshake_and_frame_exchange() {
        let (a, mut a_events) = manager("node-a", 0);
        let addr = a.start().await.unwrap();
        a.add_peer(peer("node-b"), String::new(), "tok".into());

        let (b, _b_events) = manager("node-b", 0);
        b.start().await.unwrap();
        b.add_peer(peer("node-a"), addr.to_string(), "tok".into());
        b.connect(&peer("node-a"));

        wait_open(&b).await;
        wait_open(&a).await;

        b.send(&peer("node-a"), sample_prepare()).unwrap();
        let event = timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Frame { peer: from, frame } => {
                assert_eq!(from, peer("node-b"));
                assert!(matches!(frame, Frame::Prepare(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_rejects_session() {
        let (a, mut a_events) = manager("node-a", 0);
        let addr = a.start().await.unwrap();
        a.add_peer(peer("node-b"), String::new(), "right-token".into());

        let (b, _b_events) = manager("node-b", 0);
        b.start().await.unwrap();
        b.add_peer(peer("node-a"), addr.to_string(), "wrong-token".into());
        b.connect(&peer("node-a"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.open_sessions(), 0);
        assert!(a_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unconnected_peer() {
        let (a, _events) = manager("node-a", 0);
        a.start().await.unwrap();
        assert_eq!(
            a.send(&peer("nobody"), Frame::Heartbeat),
            Err(SendError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_disconnect_surfaces_event() {
        let (a, _a_events) = manager("node-a", 0);
        let addr = a.start().await.unwrap();
        a.add_peer(peer("node-b"), String::new(), "tok".into());

        let (b, mut b_events) = manager("node-b", 0);
        b.start().await.unwrap();
        b.add_peer(peer("node-a"), addr.to_string(), "tok".into());
        b.connect(&peer("node-a"));
        wait_open(&b).await;

        b.disconnect(&peer("node-a"));
        let event = timeout(Duration::from_secs(2), b_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::Disconnected { peer: p } if p == peer("node-a")
        ));
    }

    #[tokio::test]
    async fn test_reject_roundtrip_preserves_payload() {
        let (a, mut a_events) = manager("node-a", 0);
        let addr = a.start().await.unwrap();
        a.add_peer(peer("node-b"), String::new(), "tok".into());

        let (b, _b_events) = manager("node-b", 0);
        b.start().await.unwrap();
        b.add_peer(peer("node-a"), addr.to_string(), "tok".into());
        b.connect(&peer("node-a"));
        wait_open(&b).await;
        wait_open(&a).await;

        let reject = Frame::Reject {
            condition: Condition::from_payload(b"p"),
            packet: RejectPacket {
                code: crate::codec::ErrorCode::NO_ROUTE,
                message: "no route".into(),
                payload: vec![1, 2, 3],
            },
        };
        b.send(&peer("node-a"), reject.clone()).unwrap();
        let event = timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Frame { frame, .. } => assert_eq!(frame, reject),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
