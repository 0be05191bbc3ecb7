//! Signed claims over off-chain payment channels.
//!
//! A claim asserts the cumulative amount owed on one channel at a given
//! nonce. The signed message is domain-separated by chain family
//! (`CLAIM_<TAG>`), so signatures can never be replayed across protocols or
//! chains:
//!
//! ```text
//! msg = ASCII("CLAIM_" || tag) || channelOwner (32 B)
//!    || amount (u64 LE)        || nonce (u64 LE)
//! ```
//!
//! Signatures are ed25519 and therefore deterministic: the same key and
//! inputs always produce byte-equal signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;

use crate::types::{ChainTag, PeerId};

/// 32-byte channel owner account, left-padded big-endian when the chain's
/// native address is shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelOwner(pub [u8; 32]);

impl ChannelOwner {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for ChannelOwner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() > 32 {
            return Err(format!("channel owner exceeds 32 bytes ({})", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(ChannelOwner(arr))
    }
}

impl Serialize for ChannelOwner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelOwner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A signed assertion of the cumulative amount owed on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub chain_tag: ChainTag,
    pub channel_owner: ChannelOwner,
    pub amount: u64,
    pub nonce: u64,
    #[serde(with = "serde_sig")]
    pub signature: [u8; 64],
    #[serde(with = "serde_pk")]
    pub public_key: [u8; 32],
}

mod serde_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

mod serde_pk {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pk: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(pk))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

/// Deterministic claim message. 59 bytes for the `APTOS` tag.
pub fn claim_message(
    chain_tag: &ChainTag,
    channel_owner: &ChannelOwner,
    amount: u64,
    nonce: u64,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(6 + chain_tag.as_str().len() + 32 + 8 + 8);
    msg.extend_from_slice(b"CLAIM_");
    msg.extend_from_slice(chain_tag.as_str().as_bytes());
    msg.extend_from_slice(channel_owner.as_bytes());
    msg.extend_from_slice(&amount.to_le_bytes());
    msg.extend_from_slice(&nonce.to_le_bytes());
    msg
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("nonce {attempted} does not advance past {current} on ({peer}, {chain})")]
    NonceNotMonotone {
        peer: PeerId,
        chain: ChainTag,
        current: u64,
        attempted: u64,
    },
    #[error("stale claim nonce {nonce}, highest accepted is {highest}")]
    StaleNonce { nonce: u64, highest: u64 },
    #[error("claim signature invalid")]
    BadSignature,
    #[error("claim public key invalid")]
    BadPublicKey,
}

/// Signs outgoing claims and exclusively owns the per-channel nonce
/// counters. No other component mutates them.
pub struct ClaimSigner {
    key: SigningKey,
    nonces: DashMap<(PeerId, ChainTag), u64>,
}

impl ClaimSigner {
    pub fn new(seed: &[u8; 32]) -> Self {
        ClaimSigner {
            key: SigningKey::from_bytes(seed),
            nonces: DashMap::new(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Restore a nonce counter from a persisted snapshot. Only raises the
    /// counter, never lowers it.
    pub fn restore_nonce(&self, peer: &PeerId, chain: &ChainTag, nonce: u64) {
        let mut entry = self
            .nonces
            .entry((peer.clone(), chain.clone()))
            .or_insert(0);
        if *entry < nonce {
            *entry = nonce;
        }
    }

    /// Sign a claim at an explicit nonce, which must strictly advance the
    /// counter for `(peer, chain)`.
    pub fn sign(
        &self,
        peer: &PeerId,
        chain: &ChainTag,
        channel_owner: &ChannelOwner,
        amount: u64,
        nonce: u64,
    ) -> Result<Claim, ClaimError> {
        let mut entry = self
            .nonces
            .entry((peer.clone(), chain.clone()))
            .or_insert(0);
        if nonce <= *entry {
            return Err(ClaimError::NonceNotMonotone {
                peer: peer.clone(),
                chain: chain.clone(),
                current: *entry,
                attempted: nonce,
            });
        }
        let msg = claim_message(chain, channel_owner, amount, nonce);
        let signature: Signature = self.key.sign(&msg);
        *entry = nonce;
        Ok(Claim {
            chain_tag: chain.clone(),
            channel_owner: *channel_owner,
            amount,
            nonce,
            signature: signature.to_bytes(),
            public_key: self.public_key(),
        })
    }
}

impl fmt::Debug for ClaimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimSigner")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verifies incoming claims, tracking the highest accepted nonce per
/// `(peer, channelOwner)` separately from the signer's own counters.
#[derive(Debug, Default)]
pub struct ClaimVerifier {
    highest: DashMap<(PeerId, ChannelOwner), u64>,
}

impl ClaimVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore_highest(&self, peer: &PeerId, owner: &ChannelOwner, nonce: u64) {
        let mut entry = self.highest.entry((peer.clone(), *owner)).or_insert(0);
        if *entry < nonce {
            *entry = nonce;
        }
    }

    /// Verify signature and nonce freshness. A bad signature mutates no
    /// state; a stale nonce is rejected; an accepted claim raises the
    /// highest-received mark.
    pub fn accept(&self, peer: &PeerId, claim: &Claim) -> Result<(), ClaimError> {
        let verifying_key =
            VerifyingKey::from_bytes(&claim.public_key).map_err(|_| ClaimError::BadPublicKey)?;
        let msg = claim_message(&claim.chain_tag, &claim.channel_owner, claim.amount, claim.nonce);
        verifying_key
            .verify(&msg, &Signature::from_bytes(&claim.signature))
            .map_err(|_| ClaimError::BadSignature)?;

        let mut entry = self
            .highest
            .entry((peer.clone(), claim.channel_owner))
            .or_insert(0);
        if claim.nonce <= *entry {
            return Err(ClaimError::StaleNonce {
                nonce: claim.nonce,
                highest: *entry,
            });
        }
        *entry = claim.nonce;
        Ok(())
    }

    pub fn highest_received(&self, peer: &PeerId, owner: &ChannelOwner) -> u64 {
        self.highest
            .get(&(peer.clone(), *owner))
            .map(|e| *e)
            .unwrap_or(0)
    }
}
