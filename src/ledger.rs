//! Off-chain channel ledger: per-peer, per-chain accounting of forwarded
//! value, threshold-triggered settlement, and snapshot persistence.
//!
//! Every accepted forward moves value through a three-step protocol against
//! one ledger entry: [`ChannelLedger::reserve`] before the downstream send
//! (capacity gate), then either [`ChannelLedger::commit_forward`] when the
//! Fulfill is relayed or [`ChannelLedger::release`] when the forward dies.
//! Reservations make overcommit impossible even while many packets are in
//! flight on the same channel: `owed + pending ≤ deposit` holds at every
//! step, not only between packets.
//!
//! Peers without a configured channel are unmetered: reserve succeeds and
//! commit is a no-op. Metering starts when a channel entry exists.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::claim::{Claim, ClaimError, ClaimSigner, ClaimVerifier, ChannelOwner};
use crate::types::{ChainTag, PeerId};

/// Key of one off-chain channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub peer: PeerId,
    pub chain: ChainTag,
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.peer, self.chain)
    }
}

/// Work item for the settlement worker: settle this channel now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementTask {
    pub key: ChannelKey,
}

/// One channel's ledger state.
///
/// `pending_outbound` and `settlement_pending` are process-local and not
/// persisted: in-flight forwards and queued settlements die with the
/// process, and restart re-derives both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub channel_owner: ChannelOwner,
    #[serde(with = "serde_u128")]
    pub deposit: u128,
    #[serde(with = "serde_u128")]
    pub owed_to_peer: u128,
    #[serde(with = "serde_u128")]
    pub owed_from_peer: u128,
    pub nonce: u64,
    pub highest_received_nonce: u64,
    pub last_signed_claim: Option<Claim>,
    #[serde(skip)]
    pending_outbound: u128,
    #[serde(skip)]
    settlement_pending: bool,
}

impl ChannelEntry {
    fn new(channel_owner: ChannelOwner, deposit: u128) -> Self {
        ChannelEntry {
            channel_owner,
            deposit,
            owed_to_peer: 0,
            owed_from_peer: 0,
            nonce: 0,
            highest_received_nonce: 0,
            last_signed_claim: None,
            pending_outbound: 0,
            settlement_pending: false,
        }
    }
}

mod serde_u128 {
    use serde::{Deserialize, Deserializer, Serializer};

    // Stringified to survive JSON number precision limits.
    pub fn serialize<S: Serializer>(v: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>()
            .map_err(|_| serde::de::Error::custom("expected stringified u128"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("channel {0} does not exist")]
    UnknownChannel(ChannelKey),
    #[error("channel {key} cannot carry {amount}: {available} available")]
    InsufficientCapacity {
        key: ChannelKey,
        amount: u64,
        available: u128,
    },
    #[error("claim amount {claimed} regresses below accepted {accepted}")]
    ClaimRegression { claimed: u64, accepted: u128 },
    #[error("owed amount {0} exceeds the signable claim range")]
    AmountOverflow(u128),
    #[error("no claim signer configured")]
    SignerUnavailable,
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("snapshot io: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    SnapshotEncoding(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    channels: Vec<(ChannelKey, ChannelEntry)>,
}

/// The process-wide channel ledger.
pub struct ChannelLedger {
    entries: DashMap<ChannelKey, ChannelEntry>,
    signer: Option<Arc<ClaimSigner>>,
    verifier: ClaimVerifier,
    threshold: u128,
    settle_tx: Option<mpsc::Sender<SettlementTask>>,
    snapshot_path: PathBuf,
}

impl ChannelLedger {
    pub fn new(
        threshold: u128,
        snapshot_path: PathBuf,
        signer: Option<Arc<ClaimSigner>>,
        settle_tx: Option<mpsc::Sender<SettlementTask>>,
    ) -> Self {
        ChannelLedger {
            entries: DashMap::new(),
            signer,
            verifier: ClaimVerifier::new(),
            threshold,
            settle_tx,
            snapshot_path,
        }
    }

    /// Create or refresh a channel. Deposits only move through this path
    /// (config bootstrap or the chain adapter's authoritative state).
    pub fn open_channel(&self, key: ChannelKey, channel_owner: ChannelOwner, deposit: u128) {
        self.entries
            .entry(key)
            .and_modify(|e| {
                e.deposit = deposit;
                e.channel_owner = channel_owner;
            })
            .or_insert_with(|| ChannelEntry::new(channel_owner, deposit));
    }

    /// Capacity gate, called before the downstream send. Reserves `amount`
    /// so concurrent in-flight forwards cannot jointly breach the deposit.
    pub fn reserve(&self, key: &ChannelKey, amount: u64) -> Result<(), LedgerError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            // Unmetered peer.
            return Ok(());
        };
        let committed = entry.owed_to_peer + entry.pending_outbound;
        let available = entry.deposit.saturating_sub(committed);
        if (amount as u128) > available {
            return Err(LedgerError::InsufficientCapacity {
                key: key.clone(),
                amount,
                available,
            });
        }
        entry.pending_outbound += amount as u128;
        Ok(())
    }

    /// Drop a reservation without committing (reject, timeout, disconnect).
    pub fn release(&self, key: &ChannelKey, amount: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.pending_outbound = entry.pending_outbound.saturating_sub(amount as u128);
        }
    }

    /// Commit a relayed Fulfill: move the reservation into `owed_to_peer`
    /// and evaluate the settlement threshold inside the same critical
    /// section. Returns whether a settlement task was enqueued.
    pub fn commit_forward(&self, key: &ChannelKey, amount: u64) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.pending_outbound = entry.pending_outbound.saturating_sub(amount as u128);
        entry.owed_to_peer += amount as u128;

        if entry.owed_to_peer >= self.threshold && !entry.settlement_pending {
            if let Some(tx) = &self.settle_tx {
                match tx.try_send(SettlementTask { key: key.clone() }) {
                    Ok(()) => {
                        entry.settlement_pending = true;
                        tracing::info!(
                            channel = %key,
                            owed = entry.owed_to_peer,
                            threshold = self.threshold,
                            "settlement threshold crossed"
                        );
                        return true;
                    }
                    Err(e) => {
                        // Left unsuppressed so a later commit retriggers.
                        tracing::warn!(channel = %key, error = %e, "settlement queue full");
                    }
                }
            }
        }
        false
    }

    /// Settlement outcome: reduce the owed balance and allow new triggers.
    pub async fn on_settlement_succeeded(
        &self,
        key: &ChannelKey,
        settled: u128,
        nonce: u64,
    ) -> Result<(), LedgerError> {
        {
            let mut entry = self
                .entries
                .get_mut(key)
                .ok_or_else(|| LedgerError::UnknownChannel(key.clone()))?;
            entry.owed_to_peer = entry.owed_to_peer.saturating_sub(settled);
            entry.settlement_pending = false;
            tracing::info!(channel = %key, settled, nonce, "settlement applied");
        }
        self.snapshot().await
    }

    pub fn on_settlement_failed(&self, key: &ChannelKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.settlement_pending = false;
        }
    }

    /// Produce a claim for the current owed balance at the next nonce. The
    /// signer's own counter is the authority; the entry mirrors it.
    pub fn sign_outgoing_claim(&self, key: &ChannelKey) -> Result<Claim, LedgerError> {
        let signer = self.signer.as_ref().ok_or(LedgerError::SignerUnavailable)?;
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::UnknownChannel(key.clone()))?;
        let amount = u64::try_from(entry.owed_to_peer)
            .map_err(|_| LedgerError::AmountOverflow(entry.owed_to_peer))?;
        let claim = signer.sign(
            &key.peer,
            &key.chain,
            &entry.channel_owner,
            amount,
            entry.nonce + 1,
        )?;
        entry.nonce = claim.nonce;
        entry.last_signed_claim = Some(claim.clone());
        Ok(claim)
    }

    /// Verify and record a claim presented by a peer. Accepted claims are
    /// snapshotted immediately.
    pub async fn accept_incoming_claim(
        &self,
        peer: &PeerId,
        claim: &Claim,
    ) -> Result<(), LedgerError> {
        let key = ChannelKey {
            peer: peer.clone(),
            chain: claim.chain_tag.clone(),
        };
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| ChannelEntry::new(claim.channel_owner, 0));
            if (claim.amount as u128) < entry.owed_from_peer {
                return Err(LedgerError::ClaimRegression {
                    claimed: claim.amount,
                    accepted: entry.owed_from_peer,
                });
            }
            self.verifier.accept(peer, claim)?;
            entry.owed_from_peer = claim.amount as u128;
            entry.highest_received_nonce = claim.nonce;
        }
        self.snapshot().await
    }

    /// The last claim signed for a channel, if any.
    pub fn last_signed_claim(&self, key: &ChannelKey) -> Option<Claim> {
        self.entries.get(key).and_then(|e| e.last_signed_claim.clone())
    }

    /// Serializable view of all channels, for the admin surface.
    pub fn channels(&self) -> Vec<(ChannelKey, ChannelEntry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Persist all channel state, atomically via temp-file rename.
    pub async fn snapshot(&self) -> Result<(), LedgerError> {
        let file = SnapshotFile {
            channels: self.channels(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }

    /// Reload the latest snapshot, if one exists, restoring nonce counters
    /// on the signer and verifier. Queued-but-unresolved settlements from
    /// the previous process are unknown; the next threshold crossing
    /// retriggers them and the chain dedupes by nonce.
    pub async fn restore(&self) -> Result<bool, LedgerError> {
        if !Path::new(&self.snapshot_path).exists() {
            return Ok(false);
        }
        let bytes = tokio::fs::read(&self.snapshot_path).await?;
        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        for (key, entry) in file.channels {
            if let Some(signer) = &self.signer {
                signer.restore_nonce(&key.peer, &key.chain, entry.nonce);
            }
            self.verifier
                .restore_highest(&key.peer, &entry.channel_owner, entry.highest_received_nonce);
            self.entries.insert(key, entry);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(peer: &str) -> ChannelKey {
        ChannelKey {
            peer: peer.parse().unwrap(),
            chain: ChainTag::new("APTOS").unwrap(),
        }
    }

    fn owner() -> ChannelOwner {
        ChannelOwner([0xcc; 32])
    }

    fn ledger_with_queue(
        threshold: u128,
        dir: &tempfile::TempDir,
    ) -> (ChannelLedger, mpsc::Receiver<SettlementTask>) {
        let (tx, rx) = mpsc::channel(8);
        let signer = Arc::new(ClaimSigner::new(&[9u8; 32]));
        let ledger = ChannelLedger::new(
            threshold,
            dir.path().join("snapshot.json"),
            Some(signer),
            Some(tx),
        );
        (ledger, rx)
    }

    #[tokio::test]
    async fn test_capacity_gate() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _rx) = ledger_with_queue(1_000_000, &dir);
        let k = key("c");
        ledger.open_channel(k.clone(), owner(), 100);

        ledger.reserve(&k, 60).unwrap();
        ledger.reserve(&k, 40).unwrap();
        // Deposit exhausted by reservations alone.
        assert!(matches!(
            ledger.reserve(&k, 1),
            Err(LedgerError::InsufficientCapacity { available: 0, .. })
        ));

        ledger.commit_forward(&k, 60);
        ledger.release(&k, 40);
        // Committed 60 of 100: only 40 reservable.
        assert!(ledger.reserve(&k, 41).is_err());
        ledger.reserve(&k, 40).unwrap();
    }

    #[tokio::test]
    async fn test_unmetered_peer_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, mut rx) = ledger_with_queue(10, &dir);
        let k = key("nochannel");
        ledger.reserve(&k, 1_000_000).unwrap();
        assert!(!ledger.commit_forward(&k, 1_000_000));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_threshold_triggers_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, mut rx) = ledger_with_queue(1_000, &dir);
        let k = key("c");
        ledger.open_channel(k.clone(), owner(), 10_000);

        // owedToPeer = 900.
        ledger.reserve(&k, 900).unwrap();
        ledger.commit_forward(&k, 900);
        assert!(rx.try_recv().is_err());

        // 900 + 150 crosses 1000: exactly one task.
        ledger.reserve(&k, 150).unwrap();
        assert!(ledger.commit_forward(&k, 150));
        assert_eq!(rx.try_recv().unwrap(), SettlementTask { key: k.clone() });

        // Suppressed while pending.
        ledger.reserve(&k, 50).unwrap();
        assert!(!ledger.commit_forward(&k, 50));
        assert!(rx.try_recv().is_err());

        // After settlement resolves, crossing triggers again.
        ledger.on_settlement_succeeded(&k, 1_100, 1).await.unwrap();
        ledger.reserve(&k, 1_200).unwrap();
        assert!(ledger.commit_forward(&k, 1_200));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_sign_outgoing_claim_advances_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _rx) = ledger_with_queue(1_000_000, &dir);
        let k = key("c");
        ledger.open_channel(k.clone(), owner(), 10_000);
        ledger.reserve(&k, 500).unwrap();
        ledger.commit_forward(&k, 500);

        let c1 = ledger.sign_outgoing_claim(&k).unwrap();
        assert_eq!((c1.amount, c1.nonce), (500, 1));

        ledger.reserve(&k, 250).unwrap();
        ledger.commit_forward(&k, 250);
        let c2 = ledger.sign_outgoing_claim(&k).unwrap();
        assert_eq!((c2.amount, c2.nonce), (750, 2));
        assert_eq!(ledger.last_signed_claim(&k), Some(c2));
    }

    #[tokio::test]
    async fn test_accept_incoming_claim_monotonicity() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _rx) = ledger_with_queue(1_000_000, &dir);
        let peer: PeerId = "p".parse().unwrap();
        let their_signer = ClaimSigner::new(&[7u8; 32]);
        let tag = ChainTag::new("APTOS").unwrap();

        let c1 = their_signer.sign(&peer, &tag, &owner(), 100, 1).unwrap();
        let c2 = their_signer.sign(&peer, &tag, &owner(), 250, 2).unwrap();
        ledger.accept_incoming_claim(&peer, &c1).await.unwrap();
        ledger.accept_incoming_claim(&peer, &c2).await.unwrap();

        // Replay and regression both rejected.
        assert!(ledger.accept_incoming_claim(&peer, &c1).await.is_err());
        let c3 = their_signer.sign(&peer, &tag, &owner(), 200, 3).unwrap();
        assert!(matches!(
            ledger.accept_incoming_claim(&peer, &c3).await,
            Err(LedgerError::ClaimRegression { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let (tx, _rx) = mpsc::channel(8);
        let signer = Arc::new(ClaimSigner::new(&[9u8; 32]));
        let ledger = ChannelLedger::new(1_000_000, path.clone(), Some(signer), Some(tx));

        let k = key("c");
        ledger.open_channel(k.clone(), owner(), 10_000);
        ledger.reserve(&k, 500).unwrap();
        ledger.commit_forward(&k, 500);
        ledger.sign_outgoing_claim(&k).unwrap();
        ledger.snapshot().await.unwrap();

        // Fresh process: same path, fresh signer.
        let (tx2, _rx2) = mpsc::channel(8);
        let signer2 = Arc::new(ClaimSigner::new(&[9u8; 32]));
        let restored = ChannelLedger::new(1_000_000, path, Some(signer2), Some(tx2));
        assert!(restored.restore().await.unwrap());

        let channels = restored.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].1.owed_to_peer, 500);
        assert_eq!(channels[0].1.nonce, 1);

        // The restored signer continues the nonce sequence, not restarts it.
        restored.reserve(&k, 100).unwrap();
        restored.commit_forward(&k, 100);
        let next = restored.sign_outgoing_claim(&k).unwrap();
        assert_eq!(next.nonce, 2);
    }
}
