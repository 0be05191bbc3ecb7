//! Chain adapters: the thin, fallible, async seam between the channel
//! ledger and each supported chain family.
//!
//! The connector core never constructs chain transactions itself; it hands
//! signed claims to an adapter and consumes the adapter's view of on-chain
//! channel state. Adapters are an open set behind [`ChainAdapter`].

pub mod aptos;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::claim::{Claim, ChannelOwner};
use crate::config::SettlementInfraConfig;
use crate::types::ChainTag;

/// Result of submitting a claim on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The claim was applied in this submission.
    Applied,
    /// The chain had already seen this nonce; nothing changed.
    AlreadyApplied,
}

/// On-chain view of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnChainChannelState {
    pub deposit: u128,
    pub redeemed: u128,
    pub nonce: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chain rpc returned status {0}: {1}")]
    Rpc(u16, String),
    #[error("chain response malformed: {0}")]
    MalformedResponse(String),
    #[error("no adapter registered for chain {0}")]
    UnknownChain(ChainTag),
}

/// One chain family's submission and query surface.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn tag(&self) -> &ChainTag;

    /// Submit a signed claim. Idempotent at the chain level by nonce.
    async fn submit_claim(&self, claim: &Claim) -> Result<SubmitOutcome, ChainError>;

    /// Authoritative channel state for a channel owner account.
    async fn channel_state(&self, owner: &ChannelOwner) -> Result<OnChainChannelState, ChainError>;

    async fn health(&self) -> bool;
}

/// Registry of adapters by chain tag, built from configuration.
#[derive(Default)]
pub struct ChainRegistry {
    adapters: HashMap<ChainTag, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn from_config(infra: Option<&SettlementInfraConfig>) -> Result<Self, ChainError> {
        let mut registry = ChainRegistry::default();
        if let Some(infra) = infra {
            let adapter = aptos::AptosAdapter::from_config(infra)?;
            registry.register(Arc::new(adapter));
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.tag().clone(), adapter);
    }

    pub fn get(&self, tag: &ChainTag) -> Result<Arc<dyn ChainAdapter>, ChainError> {
        self.adapters
            .get(tag)
            .cloned()
            .ok_or_else(|| ChainError::UnknownChain(tag.clone()))
    }

    pub fn tags(&self) -> impl Iterator<Item = &ChainTag> {
        self.adapters.keys()
    }
}
