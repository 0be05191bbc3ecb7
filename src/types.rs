//! Identifiers shared across the connector: peer ids and chain tags.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Opaque identifier of a peer node, unique within one connector.
///
/// Peer ids come from configuration (the dial list) and from `Hello` frames
/// presented by inbound peers. The connector never interprets their content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, PeerIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PeerIdError::Empty);
        }
        Ok(PeerId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::new(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::new(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerIdError {
    #[error("peer id must not be empty")]
    Empty,
}

/// Tag naming a chain family for channel accounting, e.g. `APTOS`.
///
/// The tag doubles as the domain-separator suffix in signed claims, so two
/// chain families can never produce interchangeable signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainTag(String);

impl ChainTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, ChainTagError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(ChainTagError::Empty);
        }
        if !tag.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(ChainTagError::InvalidCharacter(tag));
        }
        Ok(ChainTag(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainTag {
    type Err = ChainTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainTag::new(s)
    }
}

impl Serialize for ChainTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChainTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainTag::new(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainTagError {
    #[error("chain tag must not be empty")]
    Empty,
    #[error("chain tag must be uppercase ASCII alphanumeric: {0}")]
    InvalidCharacter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("peer-b").is_ok());
    }

    #[test]
    fn test_chain_tag_validation() {
        assert!(ChainTag::new("APTOS").is_ok());
        assert!(ChainTag::new("EIP155").is_ok());
        assert!(ChainTag::new("aptos").is_err());
        assert!(ChainTag::new("").is_err());
    }

    #[test]
    fn test_peer_id_serde_transparent() {
        let id: PeerId = serde_json::from_str("\"peer-a\"").unwrap();
        assert_eq!(id.as_str(), "peer-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-a\"");
    }
}
