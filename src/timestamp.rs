//! Millisecond-precision Unix timestamps used for packet expiry.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{Duration, SystemTime, SystemTimeError};

/// A Unix timestamp in milliseconds, as carried in `Prepare.expiresAt`.
///
/// Signed so that wire values before the epoch (hostile or broken senders)
/// still decode and simply read as long expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();
        Ok(Self(now as i64))
    }

    /// Whether this instant is at or before `now`.
    pub fn is_expired_at(&self, now: UnixMillis) -> bool {
        self.0 <= now.0
    }

    /// Time remaining until this instant, zero if already past.
    pub fn remaining_from(&self, now: UnixMillis) -> Duration {
        if self.0 <= now.0 {
            Duration::ZERO
        } else {
            Duration::from_millis((self.0 - now.0) as u64)
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

impl Add<Duration> for UnixMillis {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        UnixMillis(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnixMillis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixMillis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let ms = s
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be an integer"))?;
        Ok(UnixMillis(ms))
    }
}
