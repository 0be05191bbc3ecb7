//! The packet forwarder: per-Prepare state machine orchestrating expiry,
//! local termination, and downstream forwarding.
//!
//! Every accepted ingress Prepare produces exactly one terminal response
//! (Fulfill or Reject) on its source session. A forwarded Prepare lives in
//! the pending table keyed by `(next_hop, condition)` until the first of:
//! downstream Fulfill, downstream Reject, local expiry, downstream session
//! loss, or node shutdown. Concurrent Prepares with the same
//! `(next_hop, condition, amount)` coalesce onto one downstream send and all
//! wait on the same outcome.
//!
//! Channel metering brackets the downstream leg: capacity is reserved before
//! the send and either committed when the Fulfill is relayed or released on
//! every other exit. The commit happens strictly before the Fulfill reaches
//! any source session.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::address::Address;
use crate::codec::{ErrorCode, Frame, FulfillPacket, MAX_MESSAGE_LEN, PreparePacket, RejectPacket};
use crate::condition::{Condition, Fulfillment};
use crate::handler::{CodeMap, HandlerDecision, PayloadHandler, PaymentRequest};
use crate::ledger::{ChannelKey, ChannelLedger};
use crate::routing::RoutingTable;
use crate::session::{PeerSessionManager, SendError, SessionEvent};
use crate::timestamp::UnixMillis;
use crate::types::{ChainTag, PeerId};

/// Cap on how long a local handler call may run, independent of packet
/// expiry.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-blocking frame egress toward a peer. Implemented by the session
/// manager in production and by in-memory sinks in tests.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, peer: &PeerId, frame: Frame) -> Result<(), SendError>;
}

impl FrameSink for PeerSessionManager {
    fn send_frame(&self, peer: &PeerId, frame: Frame) -> Result<(), SendError> {
        self.send(peer, frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    peer: PeerId,
    condition: Condition,
}

#[derive(Debug, Clone)]
enum DownstreamOutcome {
    Fulfill { packet: FulfillPacket },
    Reject { packet: RejectPacket },
    Disconnected,
    ShuttingDown,
}

struct PendingEntry {
    amount: u64,
    waiters: usize,
    outcome_tx: watch::Sender<Option<DownstreamOutcome>>,
}

/// The per-node forwarder. Reentrant: every in-flight Prepare runs as its
/// own task against shared state.
pub struct Forwarder<S: FrameSink> {
    sink: Arc<S>,
    routing: Arc<RoutingTable>,
    ledger: Arc<ChannelLedger>,
    handler: Option<Arc<dyn PayloadHandler>>,
    code_map: CodeMap,
    local_prefixes: Vec<Address>,
    chain_tag: ChainTag,
    pending: DashMap<PendingKey, PendingEntry>,
    accepting: AtomicBool,
}

impl<S: FrameSink> Forwarder<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Arc<S>,
        routing: Arc<RoutingTable>,
        ledger: Arc<ChannelLedger>,
        handler: Option<Arc<dyn PayloadHandler>>,
        code_map: CodeMap,
        local_prefixes: Vec<Address>,
        chain_tag: ChainTag,
    ) -> Self {
        Forwarder {
            sink,
            routing,
            ledger,
            handler,
            code_map,
            local_prefixes,
            chain_tag,
            pending: DashMap::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Route one session event into the state machine. Prepares get their
    /// own task; responses and disconnects resolve pending entries inline.
    pub fn dispatch_event(self: &Arc<Self>, event: SessionEvent, tracker: &TaskTracker) {
        match event {
            SessionEvent::Frame { peer, frame } => match frame {
                Frame::Prepare(prepare) => {
                    let forwarder = Arc::clone(self);
                    tracker.spawn(async move {
                        forwarder.handle_prepare(peer, prepare).await;
                    });
                }
                Frame::Fulfill { condition, packet } => {
                    self.handle_fulfill(&peer, condition, packet);
                }
                Frame::Reject { condition, packet } => {
                    self.handle_reject(&peer, condition, packet);
                }
                // Handshake and heartbeat frames never reach the forwarder.
                _ => {}
            },
            SessionEvent::Disconnected { peer } => self.handle_disconnect(&peer),
        }
    }

    /// Drive one ingress Prepare to its single terminal response.
    pub async fn handle_prepare(&self, source: PeerId, prepare: PreparePacket) {
        let condition = prepare.condition;
        let response = self.process_prepare(&source, prepare).await;
        let kind = match &response {
            Frame::Fulfill { .. } => "fulfill",
            _ => "reject",
        };
        tracing::debug!(peer = %source, %condition, kind, "terminal response");
        if let Err(e) = self.sink.send_frame(&source, response) {
            tracing::error!(peer = %source, %condition, error = %e, "failed to emit terminal response");
        }
    }

    async fn process_prepare(&self, source: &PeerId, prepare: PreparePacket) -> Frame {
        if !self.accepting.load(Ordering::Relaxed) {
            return reject(prepare.condition, ErrorCode::SHUTTING_DOWN, "shutting down");
        }
        let Ok(now) = UnixMillis::try_now() else {
            return reject(prepare.condition, ErrorCode::INTERNAL, "internal error");
        };
        if prepare.expires_at.is_expired_at(now) {
            return reject(prepare.condition, ErrorCode::EXPIRED, "expired");
        }
        if self
            .local_prefixes
            .iter()
            .any(|p| p.is_prefix_of(&prepare.destination))
        {
            return self.terminate_locally(prepare).await;
        }
        self.forward(source, prepare, now).await
    }

    async fn terminate_locally(&self, prepare: PreparePacket) -> Frame {
        let condition = prepare.condition;
        let Some(handler) = &self.handler else {
            tracing::error!(destination = %prepare.destination, "no local handler configured");
            return reject(condition, ErrorCode::INTERNAL, "internal error");
        };

        let request = PaymentRequest {
            payment_id: Uuid::now_v7(),
            amount: prepare.amount,
            destination: prepare.destination.clone(),
            payload: prepare.payload.clone(),
        };
        let decision = match timeout(HANDLER_TIMEOUT, handler.handle(&request)).await {
            Err(_elapsed) => {
                tracing::warn!(payment_id = %request.payment_id, "local handler timed out");
                return reject(condition, ErrorCode::INTERNAL, "internal error");
            }
            Ok(Err(e)) => {
                tracing::warn!(payment_id = %request.payment_id, error = %e, "local handler failed");
                return reject(condition, ErrorCode::INTERNAL, "internal error");
            }
            Ok(Ok(decision)) => decision,
        };

        match decision {
            HandlerDecision::Accept { response_payload } => {
                let fulfillment = Fulfillment::from_payload(&prepare.payload);
                if !condition.is_met_by(&fulfillment) {
                    return reject(condition, ErrorCode::CONDITION_MISMATCH, "condition mismatch");
                }
                Frame::Fulfill {
                    condition,
                    packet: FulfillPacket {
                        fulfillment,
                        payload: response_payload,
                    },
                }
            }
            HandlerDecision::Reject {
                code,
                message,
                response_payload,
            } => Frame::Reject {
                condition,
                packet: RejectPacket {
                    code: self.code_map.map(&code),
                    message: truncate_message(&message),
                    payload: response_payload,
                },
            },
        }
    }

    async fn forward(&self, source: &PeerId, prepare: PreparePacket, now: UnixMillis) -> Frame {
        let condition = prepare.condition;
        let Some(next_hop) = self.routing.lookup(&prepare.destination) else {
            return reject(condition, ErrorCode::NO_ROUTE, "no route");
        };
        let channel = ChannelKey {
            peer: next_hop.clone(),
            chain: self.chain_tag.clone(),
        };
        let key = PendingKey {
            peer: next_hop.clone(),
            condition,
        };

        // Attach to an equivalent in-flight forward, or create one. Capacity
        // is checked before anything is allocated.
        use dashmap::mapref::entry::Entry;
        let mut created = false;
        let mut outcome_rx = match self.pending.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.amount != prepare.amount {
                    return reject(condition, ErrorCode::GENERIC, "conflicting in-flight packet");
                }
                entry.waiters += 1;
                entry.outcome_tx.subscribe()
            }
            Entry::Vacant(vacant) => {
                if let Err(e) = self.ledger.reserve(&channel, prepare.amount) {
                    tracing::debug!(channel = %channel, error = %e, "capacity refused");
                    return reject(
                        condition,
                        ErrorCode::INSUFFICIENT_CAPACITY,
                        "insufficient channel capacity",
                    );
                }
                let (outcome_tx, outcome_rx) = watch::channel(None);
                vacant.insert(PendingEntry {
                    amount: prepare.amount,
                    waiters: 1,
                    outcome_tx,
                });
                created = true;
                outcome_rx
            }
        };

        if created {
            let downstream = Frame::Prepare(prepare.clone());
            if let Err(e) = self.sink.send_frame(&next_hop, downstream) {
                self.pending.remove(&key);
                self.ledger.release(&channel, prepare.amount);
                return match e {
                    SendError::QueueFull => reject(condition, ErrorCode::INTERNAL, "egress congested"),
                    SendError::NotConnected => {
                        reject(condition, ErrorCode::PEER_DISCONNECTED, "peer disconnected")
                    }
                };
            }
            tracing::debug!(peer = %source, next_hop = %next_hop, %condition, amount = prepare.amount, "forwarded");
        }

        // Await the first of: downstream response, session loss, shutdown,
        // or this packet's own expiry.
        let outcome = tokio::select! {
            _ = tokio::time::sleep(prepare.expires_at.remaining_from(now)) => None,
            changed = outcome_rx.changed() => match changed {
                Ok(()) => outcome_rx.borrow().clone(),
                Err(_) => Some(DownstreamOutcome::Disconnected),
            },
        };

        match outcome {
            None => {
                self.detach_waiter(&key, &channel);
                reject(condition, ErrorCode::DOWNSTREAM_TIMEOUT, "downstream timeout")
            }
            Some(DownstreamOutcome::Fulfill { packet }) => Frame::Fulfill { condition, packet },
            Some(DownstreamOutcome::Reject { packet }) => Frame::Reject { condition, packet },
            Some(DownstreamOutcome::Disconnected) => {
                reject(condition, ErrorCode::PEER_DISCONNECTED, "peer disconnected")
            }
            Some(DownstreamOutcome::ShuttingDown) => {
                reject(condition, ErrorCode::SHUTTING_DOWN, "shutting down")
            }
        }
    }

    /// Downstream Fulfill: verify the hash chain, commit the channel
    /// ledger, then wake every waiter. A fulfill with no pending entry is
    /// late (expired or already answered) and is discarded without any
    /// ledger mutation.
    pub fn handle_fulfill(&self, from: &PeerId, condition: Condition, packet: FulfillPacket) {
        let key = PendingKey {
            peer: from.clone(),
            condition,
        };
        let Some((_, entry)) = self.pending.remove(&key) else {
            tracing::debug!(peer = %from, %condition, "late fulfill discarded");
            return;
        };
        let channel = ChannelKey {
            peer: from.clone(),
            chain: self.chain_tag.clone(),
        };
        if condition.is_met_by(&packet.fulfillment) {
            // Commit strictly before any waiter can relay the Fulfill.
            self.ledger.commit_forward(&channel, entry.amount);
            let _ = entry
                .outcome_tx
                .send(Some(DownstreamOutcome::Fulfill { packet }));
        } else {
            tracing::warn!(peer = %from, %condition, "fulfillment does not match condition");
            self.ledger.release(&channel, entry.amount);
            let _ = entry.outcome_tx.send(Some(DownstreamOutcome::Reject {
                packet: RejectPacket {
                    code: ErrorCode::CONDITION_MISMATCH,
                    message: "condition mismatch".into(),
                    payload: Vec::new(),
                },
            }));
        }
    }

    /// Downstream Reject: relayed to waiters unchanged.
    pub fn handle_reject(&self, from: &PeerId, condition: Condition, packet: RejectPacket) {
        let key = PendingKey {
            peer: from.clone(),
            condition,
        };
        let Some((_, entry)) = self.pending.remove(&key) else {
            tracing::debug!(peer = %from, %condition, "late reject discarded");
            return;
        };
        let channel = ChannelKey {
            peer: from.clone(),
            chain: self.chain_tag.clone(),
        };
        self.ledger.release(&channel, entry.amount);
        let _ = entry
            .outcome_tx
            .send(Some(DownstreamOutcome::Reject { packet }));
    }

    /// A downstream session died: every in-flight forward on it fails with
    /// `T01`. Unrelated sessions are untouched.
    pub fn handle_disconnect(&self, peer: &PeerId) {
        let keys: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|e| &e.key().peer == peer)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let channel = ChannelKey {
                    peer: peer.clone(),
                    chain: self.chain_tag.clone(),
                };
                self.ledger.release(&channel, entry.amount);
                let _ = entry.outcome_tx.send(Some(DownstreamOutcome::Disconnected));
            }
        }
    }

    /// Stop accepting new Prepares; in-flight ones continue to drain.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Fail every remaining in-flight forward with `T02`. Called after the
    /// drain window elapses.
    pub fn abort_pending(&self) {
        let keys: Vec<PendingKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let channel = ChannelKey {
                    peer: key.peer.clone(),
                    chain: self.chain_tag.clone(),
                };
                self.ledger.release(&channel, entry.amount);
                let _ = entry.outcome_tx.send(Some(DownstreamOutcome::ShuttingDown));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn waiter_count(&self, peer: &PeerId, condition: &Condition) -> usize {
        self.pending
            .get(&PendingKey {
                peer: peer.clone(),
                condition: *condition,
            })
            .map(|e| e.waiters)
            .unwrap_or(0)
    }

    fn detach_waiter(&self, key: &PendingKey, channel: &ChannelKey) {
        let mut last = false;
        if let Some(mut entry) = self.pending.get_mut(key) {
            entry.waiters = entry.waiters.saturating_sub(1);
            last = entry.waiters == 0;
        }
        if last {
            // Re-checked under the shard lock: a waiter attaching in the
            // meantime keeps the entry alive.
            if let Some((_, entry)) = self.pending.remove_if(key, |_, e| e.waiters == 0) {
                self.ledger.release(channel, entry.amount);
            }
        }
    }
}

fn reject(condition: Condition, code: ErrorCode, message: &str) -> Frame {
    Frame::Reject {
        condition,
        packet: RejectPacket {
            code,
            message: message.to_string(),
            payload: Vec::new(),
        },
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ChannelOwner, ClaimSigner};
    use crate::handler::HandlerError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockSink {
        sent: Mutex<Vec<(PeerId, Frame)>>,
        fail_with: Mutex<Option<SendError>>,
    }

    impl MockSink {
        fn sent_to(&self, peer: &PeerId) -> Vec<Frame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == peer)
                .map(|(_, f)| f.clone())
                .collect()
        }

        fn fail_next_with(&self, error: SendError) {
            *self.fail_with.lock().unwrap() = Some(error);
        }
    }

    impl FrameSink for MockSink {
        fn send_frame(&self, peer: &PeerId, frame: Frame) -> Result<(), SendError> {
            if let Some(error) = self.fail_with.lock().unwrap().take() {
                return Err(error);
            }
            self.sent.lock().unwrap().push((peer.clone(), frame));
            Ok(())
        }
    }

    struct MockHandler {
        decision: HandlerDecision,
        calls: AtomicUsize,
    }

    impl MockHandler {
        fn accepting(response_payload: &[u8]) -> Self {
            MockHandler {
                decision: HandlerDecision::Accept {
                    response_payload: response_payload.to_vec(),
                },
                calls: AtomicUsize::new(0),
            }
        }

        fn rejecting(code: &str, message: &str) -> Self {
            MockHandler {
                decision: HandlerDecision::Reject {
                    code: code.into(),
                    message: message.into(),
                    response_payload: Vec::new(),
                },
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PayloadHandler for MockHandler {
        async fn handle(&self, _request: &PaymentRequest) -> Result<HandlerDecision, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.clone())
        }
    }

    struct Fixture {
        forwarder: Arc<Forwarder<MockSink>>,
        sink: Arc<MockSink>,
        ledger: Arc<ChannelLedger>,
        _dir: tempfile::TempDir,
    }

    fn fixture(handler: Option<Arc<dyn PayloadHandler>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let routing = Arc::new(RoutingTable::new());
        routing.insert(&"g.dest".parse().unwrap(), "peer-c".parse().unwrap(), 0);
        let signer = Arc::new(ClaimSigner::new(&[9u8; 32]));
        let ledger = Arc::new(ChannelLedger::new(
            1_000_000,
            dir.path().join("snapshot.json"),
            Some(signer),
            None,
        ));
        let sink = Arc::new(MockSink::default());
        let code_map = CodeMap::new(HashMap::from([(
            "busy".to_string(),
            ErrorCode::HANDLER_EXHAUSTED,
        )]));
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&sink),
            routing,
            Arc::clone(&ledger),
            handler,
            code_map,
            vec!["g.me".parse().unwrap()],
            ChainTag::new("APTOS").unwrap(),
        ));
        Fixture {
            forwarder,
            sink,
            ledger,
            _dir: dir,
        }
    }

    fn source() -> PeerId {
        "peer-a".parse().unwrap()
    }

    fn next_hop() -> PeerId {
        "peer-c".parse().unwrap()
    }

    fn prepare_to(destination: &str, payload: &[u8], expires_in_ms: i64) -> PreparePacket {
        let now = UnixMillis::try_now().unwrap();
        PreparePacket {
            amount: 100,
            expires_at: UnixMillis(now.as_millis() + expires_in_ms),
            condition: Condition::from_payload(payload),
            destination: destination.parse().unwrap(),
            payload: payload.to_vec(),
        }
    }

    fn only_response(frames: &[Frame]) -> &Frame {
        let responses: Vec<&Frame> = frames
            .iter()
            .filter(|f| matches!(f, Frame::Fulfill { .. } | Frame::Reject { .. }))
            .collect();
        assert_eq!(responses.len(), 1, "expected exactly one terminal response");
        responses[0]
    }

    fn assert_rejected_with(frames: &[Frame], code: ErrorCode) {
        match only_response(frames) {
            Frame::Reject { packet, .. } => assert_eq!(packet.code, code),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    async fn wait_for_downstream(sink: &MockSink, peer: &PeerId) -> PreparePacket {
        for _ in 0..200 {
            for frame in sink.sent_to(peer) {
                if let Frame::Prepare(p) = frame {
                    return p;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("downstream prepare never sent");
    }

    #[tokio::test]
    async fn test_expired_prepare_rejected_before_handler() {
        let handler = Arc::new(MockHandler::accepting(b""));
        let f = fixture(Some(handler.clone()));
        let prepare = prepare_to("g.me.inbox", b"hello", -1_000);
        f.forwarder.handle_prepare(source(), prepare).await;

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::EXPIRED);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_route_rejected_without_inflight() {
        let f = fixture(None);
        let prepare = prepare_to("g.unknown", b"hello", 5_000);
        f.forwarder.handle_prepare(source(), prepare).await;

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::NO_ROUTE);
        assert_eq!(f.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_local_terminate_happy_path() {
        let handler = Arc::new(MockHandler::accepting(b"receipt"));
        let f = fixture(Some(handler));
        let prepare = prepare_to("g.me.inbox", b"hello", 5_000);
        f.forwarder.handle_prepare(source(), prepare).await;

        match only_response(&f.sink.sent_to(&source())) {
            Frame::Fulfill { packet, .. } => {
                assert_eq!(packet.fulfillment, Fulfillment::from_payload(b"hello"));
                assert_eq!(packet.payload, b"receipt");
            }
            other => panic!("expected fulfill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_terminate_condition_mismatch() {
        let handler = Arc::new(MockHandler::accepting(b""));
        let f = fixture(Some(handler.clone()));
        // Payload "x" but condition committed to "y".
        let mut prepare = prepare_to("g.me.inbox", b"x", 5_000);
        prepare.condition = Condition::from_payload(b"y");
        f.forwarder.handle_prepare(source(), prepare).await;

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::CONDITION_MISMATCH);
        // The handler ran and accepted; the core caught the mismatch.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_domain_code_mapping() {
        let handler = Arc::new(MockHandler::rejecting("busy", "try later"));
        let f = fixture(Some(handler));
        f.forwarder
            .handle_prepare(source(), prepare_to("g.me.x", b"p", 5_000))
            .await;
        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::HANDLER_EXHAUSTED);

        let handler = Arc::new(MockHandler::rejecting("some-unknown-code", "nope"));
        let f = fixture(Some(handler));
        f.forwarder
            .handle_prepare(source(), prepare_to("g.me.x", b"p", 5_000))
            .await;
        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::HANDLER_REJECTED);
    }

    #[tokio::test]
    async fn test_forward_fulfill_roundtrip_updates_ledger() {
        let f = fixture(None);
        let channel = ChannelKey {
            peer: next_hop(),
            chain: ChainTag::new("APTOS").unwrap(),
        };
        f.ledger
            .open_channel(channel.clone(), ChannelOwner([1; 32]), 10_000);

        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        let forwarder = Arc::clone(&f.forwarder);
        let task = tokio::spawn(async move {
            forwarder.handle_prepare(source(), prepare).await;
        });

        let downstream = wait_for_downstream(&f.sink, &next_hop()).await;
        assert_eq!(downstream.amount, 100);
        assert_eq!(downstream.destination.as_str(), "g.dest.sub");

        f.forwarder.handle_fulfill(
            &next_hop(),
            downstream.condition,
            FulfillPacket {
                fulfillment: Fulfillment::from_payload(b"hello"),
                payload: Vec::new(),
            },
        );
        task.await.unwrap();

        match only_response(&f.sink.sent_to(&source())) {
            Frame::Fulfill { packet, .. } => {
                assert_eq!(packet.fulfillment, Fulfillment::from_payload(b"hello"));
            }
            other => panic!("expected fulfill, got {other:?}"),
        }
        let channels = f.ledger.channels();
        assert_eq!(channels[0].1.owed_to_peer, 100);
        assert_eq!(f.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_bad_fulfillment_rejected_no_commit() {
        let f = fixture(None);
        let channel = ChannelKey {
            peer: next_hop(),
            chain: ChainTag::new("APTOS").unwrap(),
        };
        f.ledger
            .open_channel(channel.clone(), ChannelOwner([1; 32]), 10_000);

        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        let forwarder = Arc::clone(&f.forwarder);
        let task = tokio::spawn(async move {
            forwarder.handle_prepare(source(), prepare).await;
        });

        let downstream = wait_for_downstream(&f.sink, &next_hop()).await;
        f.forwarder.handle_fulfill(
            &next_hop(),
            downstream.condition,
            FulfillPacket {
                fulfillment: Fulfillment::from_payload(b"not-hello"),
                payload: Vec::new(),
            },
        );
        task.await.unwrap();

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::CONDITION_MISMATCH);
        assert_eq!(f.ledger.channels()[0].1.owed_to_peer, 0);
        // Reservation released: full deposit available again.
        f.ledger.reserve(&channel, 10_000).unwrap();
    }

    #[tokio::test]
    async fn test_downstream_reject_relayed_unchanged() {
        let f = fixture(None);
        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        let forwarder = Arc::clone(&f.forwarder);
        let task = tokio::spawn(async move {
            forwarder.handle_prepare(source(), prepare).await;
        });

        let downstream = wait_for_downstream(&f.sink, &next_hop()).await;
        let relayed = RejectPacket {
            code: ErrorCode::from_bytes(*b"F42").unwrap(),
            message: "domain-specific".into(),
            payload: vec![7, 7, 7],
        };
        f.forwarder
            .handle_reject(&next_hop(), downstream.condition, relayed.clone());
        task.await.unwrap();

        match only_response(&f.sink.sent_to(&source())) {
            Frame::Reject { packet, .. } => assert_eq!(packet, &relayed),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expiry_then_late_fulfill_discarded() {
        let f = fixture(None);
        let channel = ChannelKey {
            peer: next_hop(),
            chain: ChainTag::new("APTOS").unwrap(),
        };
        f.ledger
            .open_channel(channel.clone(), ChannelOwner([1; 32]), 10_000);

        let prepare = prepare_to("g.dest.sub", b"hello", 150);
        let condition = prepare.condition;
        f.forwarder.handle_prepare(source(), prepare).await;
        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::DOWNSTREAM_TIMEOUT);

        // Late fulfill after expiry: discarded, ledger untouched.
        f.forwarder.handle_fulfill(
            &next_hop(),
            condition,
            FulfillPacket {
                fulfillment: Fulfillment::from_payload(b"hello"),
                payload: Vec::new(),
            },
        );
        assert_eq!(f.ledger.channels()[0].1.owed_to_peer, 0);
        // No second response to the source.
        only_response(&f.sink.sent_to(&source()));
    }

    #[tokio::test]
    async fn test_duplicate_prepares_coalesce_downstream() {
        let f = fixture(None);
        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);

        let forwarder1 = Arc::clone(&f.forwarder);
        let p1 = prepare.clone();
        let task1 = tokio::spawn(async move {
            forwarder1.handle_prepare("peer-a".parse().unwrap(), p1).await;
        });
        let forwarder2 = Arc::clone(&f.forwarder);
        let p2 = prepare.clone();
        let task2 = tokio::spawn(async move {
            forwarder2.handle_prepare("peer-b".parse().unwrap(), p2).await;
        });

        let downstream = wait_for_downstream(&f.sink, &next_hop()).await;
        // Both ingress packets must be attached before the response lands.
        for _ in 0..200 {
            if f.forwarder.waiter_count(&next_hop(), &downstream.condition) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            f.forwarder.waiter_count(&next_hop(), &downstream.condition),
            2
        );

        f.forwarder.handle_fulfill(
            &next_hop(),
            downstream.condition,
            FulfillPacket {
                fulfillment: Fulfillment::from_payload(b"hello"),
                payload: Vec::new(),
            },
        );
        task1.await.unwrap();
        task2.await.unwrap();

        // Exactly one downstream Prepare despite two ingress packets.
        let downstream_prepares = f
            .sink
            .sent_to(&next_hop())
            .iter()
            .filter(|frame| matches!(frame, Frame::Prepare(_)))
            .count();
        assert_eq!(downstream_prepares, 1);
        // Both sources got their Fulfill.
        only_response(&f.sink.sent_to(&"peer-a".parse().unwrap()));
        only_response(&f.sink.sent_to(&"peer-b".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_capacity_refused_before_send() {
        let f = fixture(None);
        let channel = ChannelKey {
            peer: next_hop(),
            chain: ChainTag::new("APTOS").unwrap(),
        };
        f.ledger.open_channel(channel, ChannelOwner([1; 32]), 50);

        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        f.forwarder.handle_prepare(source(), prepare).await;

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::INSUFFICIENT_CAPACITY);
        // Nothing went downstream and nothing is pending.
        assert!(f.sink.sent_to(&next_hop()).is_empty());
        assert_eq!(f.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_inflight_with_t01() {
        let f = fixture(None);
        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        let forwarder = Arc::clone(&f.forwarder);
        let task = tokio::spawn(async move {
            forwarder.handle_prepare(source(), prepare).await;
        });
        wait_for_downstream(&f.sink, &next_hop()).await;

        f.forwarder.handle_disconnect(&next_hop());
        task.await.unwrap();

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::PEER_DISCONNECTED);
        assert_eq!(f.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_and_aborts_pending() {
        let f = fixture(None);
        let prepare = prepare_to("g.dest.sub", b"hello", 30_000);
        let forwarder = Arc::clone(&f.forwarder);
        let task = tokio::spawn(async move {
            forwarder.handle_prepare(source(), prepare).await;
        });
        wait_for_downstream(&f.sink, &next_hop()).await;

        f.forwarder.begin_shutdown();
        f.forwarder
            .handle_prepare("peer-b".parse().unwrap(), prepare_to("g.dest.x", b"q", 5_000))
            .await;
        assert_rejected_with(
            &f.sink.sent_to(&"peer-b".parse().unwrap()),
            ErrorCode::SHUTTING_DOWN,
        );

        f.forwarder.abort_pending();
        task.await.unwrap();
        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::SHUTTING_DOWN);
    }

    #[tokio::test]
    async fn test_send_failure_releases_reservation() {
        let f = fixture(None);
        let channel = ChannelKey {
            peer: next_hop(),
            chain: ChainTag::new("APTOS").unwrap(),
        };
        f.ledger
            .open_channel(channel.clone(), ChannelOwner([1; 32]), 200);

        f.sink.fail_next_with(SendError::NotConnected);
        let prepare = prepare_to("g.dest.sub", b"hello", 5_000);
        f.forwarder.handle_prepare(source(), prepare).await;

        assert_rejected_with(&f.sink.sent_to(&source()), ErrorCode::PEER_DISCONNECTED);
        assert_eq!(f.forwarder.pending_count(), 0);
        // Reservation was rolled back.
        f.ledger.reserve(&channel, 200).unwrap();
    }
}
