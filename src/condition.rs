//! The condition/fulfillment hash chain.
//!
//! A `Prepare` carries a 32-byte condition; the packet completes when someone
//! presents a fulfillment whose SHA-256 equals that condition. Fulfillments
//! are themselves derived from the payload (`fulfillment = SHA256(payload)`),
//! so a sender computes the condition as `SHA256(SHA256(payload))` up front
//! and any honest terminating endpoint can fulfill without shared session
//! state.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};

/// 32-byte commitment published in a `Prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition(pub [u8; 32]);

/// 32-byte preimage such that `SHA256(fulfillment) == condition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fulfillment(pub [u8; 32]);

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

impl Fulfillment {
    /// Derive the fulfillment for a payload. The empty payload is valid; its
    /// fulfillment is the SHA-256 of the empty string.
    pub fn from_payload(payload: &[u8]) -> Self {
        Fulfillment(sha256(payload))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Condition {
    pub fn from_fulfillment(fulfillment: &Fulfillment) -> Self {
        Condition(sha256(&fulfillment.0))
    }

    /// Sender-side shortcut: `SHA256(SHA256(payload))`.
    pub fn from_payload(payload: &[u8]) -> Self {
        Condition::from_fulfillment(&Fulfillment::from_payload(payload))
    }

    /// True iff `self == SHA256(fulfillment)`.
    pub fn is_met_by(&self, fulfillment: &Fulfillment) -> bool {
        Condition::from_fulfillment(fulfillment) == *self
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Display for Fulfillment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes: [u8; 32] = hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("condition must be 32 bytes"))?;
        Ok(Condition(bytes))
    }
}
