//! Logical clock tokens for last-writer-wins resolution
//!
//! A token is the pair `(wall-clock millis, peer id)` written as
//! `"<timestamp>:<peerId>"`. Tokens are totally ordered: timestamps compare
//! numerically and equal timestamps fall back to comparing peer ids
//! lexicographically. No clock synchronization happens between peers, so
//! under skew the ordering is eventual rather than strict.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MeshError;
use crate::types::PeerId;

/// Causality token stamped on every record mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockToken {
    /// Wall-clock milliseconds at the mutating peer
    timestamp: u64,
    /// Identifier of the mutating peer (tiebreak)
    peer: String,
}

impl ClockToken {
    /// Build a token from its parts
    pub fn new(timestamp: u64, peer: impl Into<String>) -> Self {
        Self {
            timestamp,
            peer: peer.into(),
        }
    }

    /// Stamp a new token for a mutation made by `local` right now
    pub fn generate(local: &PeerId) -> Self {
        Self::new(now_millis(), local.as_str())
    }

    /// Stamp a mutation by `local` of a record currently at `previous`
    ///
    /// The result always orders after `previous`, even when the local wall
    /// clock lags the peer that wrote it.
    pub fn successor(local: &PeerId, previous: &ClockToken) -> Self {
        let timestamp = now_millis().max(previous.timestamp.saturating_add(1));
        Self::new(timestamp, local.as_str())
    }

    /// Sentinel "no records yet" token scoped to the local peer
    pub fn zero(local: &PeerId) -> Self {
        Self::new(0, local.as_str())
    }

    /// Greatest token in `tokens`, or the zero token for `local` when empty
    pub fn max_of<'a, I>(tokens: I, local: &PeerId) -> Self
    where
        I: IntoIterator<Item = &'a ClockToken>,
    {
        tokens
            .into_iter()
            .max()
            .cloned()
            .unwrap_or_else(|| Self::zero(local))
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Compare two tokens under the total order.
///
/// Identical tokens short-circuit to `Equal`.
pub fn compare(a: &ClockToken, b: &ClockToken) -> Ordering {
    if std::ptr::eq(a, b) {
        return Ordering::Equal;
    }
    a.cmp(b)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl fmt::Display for ClockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.peer)
    }
}

impl FromStr for ClockToken {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, peer) = s
            .split_once(':')
            .ok_or_else(|| MeshError::InvalidClock(s.to_string()))?;
        let timestamp = ts
            .trim()
            .parse::<u64>()
            .map_err(|_| MeshError::InvalidClock(s.to_string()))?;
        Ok(Self::new(timestamp, peer))
    }
}

impl Serialize for ClockToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> ClockToken {
        s.parse().unwrap()
    }

    #[test]
    fn test_successor_orders_after_future_version() {
        let local = PeerId::new("peer-a");
        // A version stamped far ahead of the local wall clock, by a peer that
        // would win the tiebreak
        let ahead = ClockToken::new(now_millis() + 60_000, "peer-z");
        let next = ClockToken::successor(&local, &ahead);
        assert_eq!(next.timestamp(), ahead.timestamp() + 1);
        assert_eq!(next.peer(), "peer-a");
        assert_eq!(compare(&next, &ahead), Ordering::Greater);
    }

    #[test]
    fn test_successor_uses_wall_clock_when_ahead() {
        let local = PeerId::new("peer-a");
        let before = now_millis();
        let next = ClockToken::successor(&local, &ClockToken::new(5, "peer-b"));
        assert!(next.timestamp() >= before);
    }

    #[test]
    fn test_parse_and_display() {
        let t = token("1700000000000:peer-abc12-1");
        assert_eq!(t.timestamp(), 1_700_000_000_000);
        assert_eq!(t.peer(), "peer-abc12-1");
        assert_eq!(t.to_string(), "1700000000000:peer-abc12-1");
    }

    #[test]
    fn test_peer_part_may_contain_colons() {
        let t = token("5:a:b");
        assert_eq!(t.timestamp(), 5);
        assert_eq!(t.peer(), "a:b");
    }

    #[test]
    fn test_invalid_tokens() {
        assert!("no-separator".parse::<ClockToken>().is_err());
        assert!("abc:peer".parse::<ClockToken>().is_err());
        assert!(":peer".parse::<ClockToken>().is_err());
    }

    #[test]
    fn test_timestamp_dominates() {
        assert_eq!(compare(&token("100:A"), &token("50:B")), Ordering::Greater);
        assert_eq!(compare(&token("50:Z"), &token("100:A")), Ordering::Less);
        // numeric, not lexicographic, timestamp comparison
        assert_eq!(compare(&token("9:A"), &token("10:A")), Ordering::Less);
    }

    #[test]
    fn test_peer_breaks_ties() {
        assert_eq!(compare(&token("100:p1"), &token("100:p2")), Ordering::Less);
        assert_eq!(compare(&token("100:p2"), &token("100:p1")), Ordering::Greater);
    }

    #[test]
    fn test_compare_self_is_equal() {
        let t = token("42:me");
        assert_eq!(compare(&t, &t), Ordering::Equal);
        assert_eq!(compare(&t, &t.clone()), Ordering::Equal);
    }

    #[test]
    fn test_max_of() {
        let local = PeerId::new("local");
        let tokens = vec![token("3:a"), token("7:b"), token("7:a"), token("1:z")];
        assert_eq!(ClockToken::max_of(&tokens, &local), token("7:b"));
    }

    #[test]
    fn test_max_of_empty_is_zero_token() {
        let local = PeerId::new("local");
        let empty: Vec<ClockToken> = Vec::new();
        assert_eq!(ClockToken::max_of(&empty, &local).to_string(), "0:local");
    }

    #[test]
    fn test_generate_uses_local_peer() {
        let local = PeerId::new("peer-x");
        let t = ClockToken::generate(&local);
        assert_eq!(t.peer(), "peer-x");
        assert!(t.timestamp() > 0);
    }

    #[test]
    fn test_serde_as_string() {
        let t = token("12:peer");
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"12:peer\"");
        let back: ClockToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
