//! Hierarchical destination addresses.
//!
//! An address is an ordered sequence of lowercase labels joined by `.`, e.g.
//! `g.agents.alice.inbox`. Routing works on label-aligned prefixes: the entry
//! `g.agents` matches `g.agents.alice` but never `g.agentsmith`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Maximum encoded length of an address in bytes.
pub const MAX_ADDRESS_LEN: usize = 1023;

/// A validated hierarchical address.
///
/// Invariants held by construction: at least one label, every label non-empty
/// and drawn from `[a-z0-9_~-]`, no leading or trailing dot, total length at
/// most [`MAX_ADDRESS_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate the dot-separated labels in order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Label-aligned prefix test: true iff `other == self` or `other` starts
    /// with `self` followed by a dot.
    pub fn is_prefix_of(&self, other: &Address) -> bool {
        let p = self.0.as_str();
        let a = other.0.as_str();
        if a == p {
            return true;
        }
        a.len() > p.len() && a.starts_with(p) && a.as_bytes()[p.len()] == b'.'
    }

    fn validate_label(label: &str) -> Result<(), AddressError> {
        if label.is_empty() {
            return Err(AddressError::EmptyLabel);
        }
        let ok = label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'~' | b'-'));
        if !ok {
            return Err(AddressError::InvalidCharacter(label.to_string()));
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if s.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(s.len()));
        }
        for label in s.split('.') {
            Self::validate_label(label)?;
        }
        Ok(Address(s.to_string()))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AddressError {
    #[error("address must not be empty")]
    Empty,
    #[error("address exceeds {MAX_ADDRESS_LEN} bytes ({0})")]
    TooLong(usize),
    #[error("address label must not be empty")]
    EmptyLabel,
    #[error("address label contains invalid characters: {0:?}")]
    InvalidCharacter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_valid() {
        assert_eq!(addr("g").as_str(), "g");
        assert_eq!(addr("g.agents.alice_01.in~box-x").labels().count(), 4);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Address>().is_err());
        assert!("g.".parse::<Address>().is_err());
        assert!(".g".parse::<Address>().is_err());
        assert!("g..x".parse::<Address>().is_err());
        assert!("G.upper".parse::<Address>().is_err());
        assert!("g.sp ace".parse::<Address>().is_err());
    }

    #[test]
    fn test_parse_rejects_oversized() {
        let long = "a".repeat(MAX_ADDRESS_LEN + 1);
        assert!(long.parse::<Address>().is_err());
        let max = "a".repeat(MAX_ADDRESS_LEN);
        assert!(max.parse::<Address>().is_ok());
    }

    #[test]
    fn test_prefix_is_label_aligned() {
        assert!(addr("g").is_prefix_of(&addr("g")));
        assert!(addr("g").is_prefix_of(&addr("g.x.y")));
        assert!(addr("g.x").is_prefix_of(&addr("g.x.y")));
        assert!(!addr("g.x").is_prefix_of(&addr("g.xy")));
        assert!(!addr("g.x.y").is_prefix_of(&addr("g.x")));
        assert!(!addr("g.a").is_prefix_of(&addr("g.b")));
    }

    #[test]
    fn test_serde_string_form() {
        let a: Address = serde_json::from_str("\"g.dest.sub\"").unwrap();
        assert_eq!(a, addr("g.dest.sub"));
        assert!(serde_json::from_str::<Address>("\"Bad.Label\"").is_err());
    }
}
