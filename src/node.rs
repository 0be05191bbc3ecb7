//! Node orchestrator: owns every process-wide subsystem, wires the packet
//! pipeline together, and drives startup, health, and graceful shutdown.
//!
//! Construction order is config validation, then state (routing table,
//! ledger, chain registry), then transport (peer listener and dials), then
//! surfaces (health endpoint). Shutdown tears down in reverse: stop packet
//! intake, drain in-flight forwards, close sessions, flush the ledger
//! snapshot, stop listeners.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{ChainError, ChainRegistry};
use crate::claim::ClaimSigner;
use crate::config::{DeploymentMode, NodeConfig};
use crate::forwarder::Forwarder;
use crate::handler::{CodeMap, HandlerError, HttpPayloadHandler, PayloadHandler};
use crate::http::{self, HttpState};
use crate::ledger::{ChannelKey, ChannelLedger, LedgerError};
use crate::session::{PeerSessionManager, SessionError};
use crate::settlement::SettlementWorker;
use crate::routing::RoutingTable;

const HEALTH_EVAL_INTERVAL: Duration = Duration::from_secs(2);
const EVENT_QUEUE: usize = 1024;

/// Node health, as exposed on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("health endpoint failed to bind: {0}")]
    HealthBind(std::io::Error),
}

/// A running connector node.
pub struct Node {
    config: NodeConfig,
    routing: Arc<RoutingTable>,
    sessions: Arc<PeerSessionManager>,
    forwarder: Arc<Forwarder<PeerSessionManager>>,
    ledger: Arc<ChannelLedger>,
    health_tx: watch::Sender<HealthStatus>,
    peer_addr: SocketAddr,
    health_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Node {
    /// Start with the local-delivery handler derived from configuration
    /// (HTTP delivery in standalone mode, none otherwise).
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let handler: Option<Arc<dyn PayloadHandler>> = match config.deployment_mode {
            DeploymentMode::Standalone => match &config.handler_url {
                Some(url) => Some(Arc::new(HttpPayloadHandler::new(
                    url,
                    Duration::from_secs(30),
                )?)),
                None => None,
            },
            DeploymentMode::Embedded => None,
        };
        Self::start_with_handler(config, handler, CodeMap::default()).await
    }

    /// Start with an injected handler (embedded deployments) and
    /// handler-domain code mappings.
    pub async fn start_with_handler(
        config: NodeConfig,
        handler: Option<Arc<dyn PayloadHandler>>,
        code_map: CodeMap,
    ) -> Result<Node, NodeError> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let started_at = Instant::now();

        // Routing table from config.
        let routing = Arc::new(RoutingTable::new());
        for route in &config.routes {
            if route.prefix.is_empty() {
                routing.insert_default(route.next_hop.clone(), route.priority);
            } else {
                match route.prefix.parse() {
                    Ok(prefix) => routing.insert(&prefix, route.next_hop.clone(), route.priority),
                    Err(e) => {
                        tracing::warn!(prefix = %route.prefix, error = %e, "skipping invalid route")
                    }
                }
            }
        }

        // Ledger, claims, settlement queue.
        let signer = config
            .settlement_infra
            .as_ref()
            .map(|infra| Arc::new(ClaimSigner::new(infra.private_key.as_bytes())));
        let (settle_tx, settle_rx) = if config.settlement.enabled {
            let (tx, rx) = mpsc::channel(64);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let ledger = Arc::new(ChannelLedger::new(
            config.settlement.threshold as u128,
            config.ledger_snapshot_path.clone(),
            signer,
            settle_tx,
        ));
        if ledger.restore().await? {
            tracing::info!("ledger snapshot restored");
        }
        let chain_tag = config.chain_tag();
        for peer in &config.peers {
            if let Some(channel) = &peer.channel {
                ledger.open_channel(
                    ChannelKey {
                        peer: peer.id.clone(),
                        chain: chain_tag.clone(),
                    },
                    channel.channel_owner,
                    channel.deposit as u128,
                );
            }
        }

        let chains = Arc::new(ChainRegistry::from_config(config.settlement_infra.as_ref())?);

        // Transport and forwarder.
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
        let sessions = PeerSessionManager::from_config(&config, events_tx, cancel.child_token());
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&sessions),
            Arc::clone(&routing),
            Arc::clone(&ledger),
            handler,
            code_map,
            config.local_prefixes.clone(),
            chain_tag.clone(),
        ));

        let peer_addr = sessions.start().await?;

        // Refresh channel deposits from chain, best-effort.
        {
            let ledger = Arc::clone(&ledger);
            let chains = Arc::clone(&chains);
            let chain_tag = chain_tag.clone();
            let channels = ledger.channels();
            tracker.spawn(async move {
                let Ok(adapter) = chains.get(&chain_tag) else {
                    return;
                };
                for (key, entry) in channels {
                    match adapter.channel_state(&entry.channel_owner).await {
                        Ok(state) => {
                            let deposit = state.deposit.saturating_sub(state.redeemed);
                            ledger.open_channel(key, entry.channel_owner, deposit);
                        }
                        Err(e) => {
                            tracing::warn!(channel = %key, error = %e, "channel state refresh failed");
                        }
                    }
                }
            });
        }

        // Settlement worker.
        if let Some(settle_rx) = settle_rx {
            let worker = SettlementWorker::new(
                &config.settlement,
                Arc::clone(&ledger),
                Arc::clone(&chains),
                cancel.child_token(),
            );
            tracker.spawn(worker.run(settle_rx));
        }

        // Event pump: hand inbound frames to the forwarder.
        {
            let forwarder = Arc::clone(&forwarder);
            let pump_cancel = cancel.child_token();
            let pump_tracker = tracker.clone();
            tracker.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = pump_cancel.cancelled() => return,
                        event = events_rx.recv() => match event {
                            Some(event) => event,
                            None => return,
                        },
                    };
                    forwarder.dispatch_event(event, &pump_tracker);
                }
            });
        }

        // Periodic ledger snapshots.
        {
            let ledger = Arc::clone(&ledger);
            let snapshot_cancel = cancel.child_token();
            let interval = Duration::from_secs(config.snapshot_interval_secs.max(1));
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = snapshot_cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = ledger.snapshot().await {
                        tracing::warn!(error = %e, "periodic ledger snapshot failed");
                    }
                }
            });
        }

        // Health evaluation.
        let (health_tx, health_rx) = watch::channel(HealthStatus::Starting);
        {
            let health_tx = health_tx.clone();
            let sessions = Arc::clone(&sessions);
            let health_cancel = cancel.child_token();
            tracker.spawn(async move {
                loop {
                    let evaluated = evaluate_health(&sessions);
                    let previous = *health_tx.borrow();
                    // A starting node stays starting until it first reaches
                    // the healthy threshold.
                    let status = match (previous, evaluated) {
                        (HealthStatus::Starting, HealthStatus::Unhealthy) => HealthStatus::Starting,
                        _ => evaluated,
                    };
                    if previous != status {
                        tracing::info!(?previous, ?status, "health transition");
                        let _ = health_tx.send(status);
                    }
                    tokio::select! {
                        _ = health_cancel.cancelled() => return,
                        _ = tokio::time::sleep(HEALTH_EVAL_INTERVAL) => {}
                    }
                }
            });
        }

        // Health/admin endpoint.
        let http_state = Arc::new(HttpState {
            node_id: config.node_id.clone(),
            version: env!("CARGO_PKG_VERSION"),
            started_at,
            health: health_rx,
            sessions: Arc::clone(&sessions),
            routing: Arc::clone(&routing),
            ledger: Arc::clone(&ledger),
            admin: config.admin_api.clone(),
        });
        let health_addr = http::serve(http_state, config.health_port, cancel.child_token())
            .await
            .map_err(NodeError::HealthBind)?;

        tracing::info!(
            node_id = %config.node_id,
            %peer_addr,
            %health_addr,
            "node ready"
        );

        Ok(Node {
            config,
            routing,
            sessions,
            forwarder,
            ledger,
            health_tx,
            peer_addr,
            health_addr,
            cancel,
            tracker,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    pub fn health(&self) -> HealthStatus {
        *self.health_tx.borrow()
    }

    pub fn open_peer_sessions(&self) -> usize {
        self.sessions.open_sessions()
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn ledger(&self) -> &Arc<ChannelLedger> {
        &self.ledger
    }

    /// Graceful shutdown: no Prepare accepted on the wire is dropped
    /// silently. In-flight forwards get the drain window, then fail with
    /// `T02`; the ledger snapshot flushes last.
    pub async fn stop(self) {
        tracing::info!(node_id = %self.config.node_id, "shutting down");
        let _ = self.health_tx.send(HealthStatus::Starting);
        self.forwarder.begin_shutdown();

        let drain_deadline =
            Instant::now() + Duration::from_secs(self.config.drain_timeout_secs);
        while self.forwarder.pending_count() > 0 && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.forwarder.abort_pending();
        // Let aborted waiters flush their rejects through the sessions.
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.cancel.cancel();
        self.sessions.shutdown().await;
        if let Err(e) = self.ledger.snapshot().await {
            tracing::warn!(error = %e, "final ledger snapshot failed");
        }
        self.tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.tracker.wait()).await;
        tracing::info!("shutdown complete");
    }
}

fn evaluate_health(sessions: &PeerSessionManager) -> HealthStatus {
    let total = sessions.configured_peers();
    if total == 0 {
        return HealthStatus::Healthy;
    }
    let open = sessions.open_sessions();
    if open * 2 >= total {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    }
}
