//! Settlement worker: drains threshold-crossing events from the ledger and
//! submits signed claims through the chain adapters.
//!
//! Submission is strictly serialized per channel so claims reach the chain
//! in nonce order; distinct channels settle in parallel. The worker is
//! fully decoupled from the packet pipeline: a slow or failing chain never
//! delays a forward.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::ChainRegistry;
use crate::config::SettlementConfig;
use crate::ledger::{ChannelKey, ChannelLedger, SettlementTask};

/// Per-channel lane queue depth. A lane only ever needs one queued ping
/// beyond the running submission; extra triggers collapse.
const LANE_QUEUE: usize = 2;

pub struct SettlementWorker {
    ledger: Arc<ChannelLedger>,
    chains: Arc<ChainRegistry>,
    submit_timeout: Duration,
    retry_delay: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    lanes: DashMap<ChannelKey, mpsc::Sender<()>>,
}

impl SettlementWorker {
    pub fn new(
        config: &SettlementConfig,
        ledger: Arc<ChannelLedger>,
        chains: Arc<ChainRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(SettlementWorker {
            ledger,
            chains,
            submit_timeout: Duration::from_secs(config.timeout_secs),
            retry_delay: Duration::from_millis(config.polling_interval_ms),
            cancel,
            tracker: TaskTracker::new(),
            lanes: DashMap::new(),
        })
    }

    /// Run the dispatcher until the queue closes or shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut tasks: mpsc::Receiver<SettlementTask>) {
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.dispatch(task.key);
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Hand the channel to its lane, spawning the lane on first use. A full
    /// lane queue means a settlement is already running and another is
    /// queued behind it; the trigger collapses into that one.
    fn dispatch(self: &Arc<Self>, key: ChannelKey) {
        use dashmap::mapref::entry::Entry;
        let tx = match self.lanes.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(LANE_QUEUE);
                vacant.insert(tx.clone());
                let worker = Arc::clone(self);
                let lane_key = key.clone();
                self.tracker.spawn(async move {
                    worker.lane_loop(lane_key, rx).await;
                });
                tx
            }
        };
        let _ = tx.try_send(());
    }

    async fn lane_loop(self: Arc<Self>, key: ChannelKey, mut pings: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                ping = pings.recv() => match ping {
                    Some(()) => self.settle_channel(&key).await,
                    None => return,
                },
            }
        }
    }

    /// One settlement round: sign the current owed balance and push it on
    /// chain, retrying on transient failure until shutdown.
    async fn settle_channel(&self, key: &ChannelKey) {
        loop {
            // Re-sign each attempt so retries carry the freshest balance.
            let claim = match self.ledger.sign_outgoing_claim(key) {
                Ok(claim) => claim,
                Err(e) => {
                    tracing::error!(channel = %key, error = %e, "cannot sign settlement claim");
                    self.ledger.on_settlement_failed(key);
                    return;
                }
            };
            let adapter = match self.chains.get(&key.chain) {
                Ok(adapter) => adapter,
                Err(e) => {
                    tracing::error!(channel = %key, error = %e, "no chain adapter for settlement");
                    self.ledger.on_settlement_failed(key);
                    return;
                }
            };

            let submitted = timeout(self.submit_timeout, adapter.submit_claim(&claim)).await;
            match submitted {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        channel = %key,
                        amount = claim.amount,
                        nonce = claim.nonce,
                        ?outcome,
                        "settlement submitted"
                    );
                    if let Err(e) = self
                        .ledger
                        .on_settlement_succeeded(key, claim.amount as u128, claim.nonce)
                        .await
                    {
                        tracing::warn!(channel = %key, error = %e, "settlement bookkeeping failed");
                    }
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(channel = %key, error = %e, "settlement submission failed");
                }
                Err(_elapsed) => {
                    tracing::warn!(channel = %key, "settlement submission timed out");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.ledger.on_settlement_failed(key);
                    return;
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainAdapter, ChainError, OnChainChannelState, SubmitOutcome};
    use crate::claim::{Claim, ClaimSigner, ChannelOwner};
    use crate::types::ChainTag;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAdapter {
        tag: ChainTag,
        submissions: Mutex<Vec<Claim>>,
        fail_first: AtomicUsize,
    }

    impl MockAdapter {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(MockAdapter {
                tag: ChainTag::new("APTOS").unwrap(),
                submissions: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl ChainAdapter for MockAdapter {
        fn tag(&self) -> &ChainTag {
            &self.tag
        }

        async fn submit_claim(&self, claim: &Claim) -> Result<SubmitOutcome, ChainError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChainError::Rpc(503, "unavailable".into()));
            }
            self.submissions.lock().unwrap().push(claim.clone());
            Ok(SubmitOutcome::Applied)
        }

        async fn channel_state(
            &self,
            _owner: &ChannelOwner,
        ) -> Result<OnChainChannelState, ChainError> {
            Ok(OnChainChannelState {
                deposit: 0,
                redeemed: 0,
                nonce: 0,
            })
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn worker_config() -> SettlementConfig {
        SettlementConfig {
            enabled: true,
            threshold: 1_000,
            polling_interval_ms: 10,
            timeout_secs: 5,
        }
    }

    fn channel_key() -> ChannelKey {
        ChannelKey {
            peer: "peer-c".parse().unwrap(),
            chain: ChainTag::new("APTOS").unwrap(),
        }
    }

    async fn run_worker_once(
        adapter: Arc<MockAdapter>,
        dir: &tempfile::TempDir,
        owed: u64,
    ) -> (Arc<ChannelLedger>, CancellationToken) {
        let (settle_tx, settle_rx) = mpsc::channel(8);
        let signer = Arc::new(ClaimSigner::new(&[9u8; 32]));
        let ledger = Arc::new(ChannelLedger::new(
            1_000,
            dir.path().join("snapshot.json"),
            Some(signer),
            Some(settle_tx),
        ));
        let key = channel_key();
        ledger.open_channel(key.clone(), ChannelOwner([2; 32]), 1_000_000);
        ledger.reserve(&key, owed).unwrap();
        assert!(ledger.commit_forward(&key, owed));

        let mut chains = ChainRegistry::default();
        chains.register(adapter);
        let cancel = CancellationToken::new();
        let worker = SettlementWorker::new(
            &worker_config(),
            Arc::clone(&ledger),
            Arc::new(chains),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run(settle_rx));

        // Wait for the balance to clear.
        for _ in 0..200 {
            if ledger.channels()[0].1.owed_to_peer == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        (ledger, cancel)
    }

    #[tokio::test]
    async fn test_settles_on_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockAdapter::new(0);
        let (ledger, _cancel) = run_worker_once(Arc::clone(&adapter), &dir, 1_500).await;

        let submissions = adapter.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].amount, 1_500);
        assert_eq!(submissions[0].nonce, 1);
        assert_eq!(ledger.channels()[0].1.owed_to_peer, 0);
    }

    #[tokio::test]
    async fn test_retries_after_failure_with_fresh_claim() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockAdapter::new(2);
        let (_ledger, _cancel) = run_worker_once(Arc::clone(&adapter), &dir, 1_500).await;

        let submissions = adapter.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        // Two failed attempts burned nonces 1 and 2; the applied claim is 3.
        assert_eq!(submissions[0].nonce, 3);
        assert_eq!(submissions[0].amount, 1_500);
    }
}
