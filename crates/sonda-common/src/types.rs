//! Core value types for the ping engine

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A resolved ping destination.
///
/// Carries the host string the caller asked for, the IPv4 address it
/// resolved to, and the derived dotted-decimal form. Immutable once
/// constructed; a new lookup produces a new `Destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Hostname or literal as given by the caller
    pub host: String,

    /// Resolved IPv4 address
    pub address: Ipv4Addr,

    /// Dotted-decimal rendering of `address`
    pub ip_string: String,
}

impl Destination {
    pub fn new(host: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            host: host.into(),
            address,
            ip_string: address.to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host == self.ip_string {
            write!(f, "{}", self.ip_string)
        } else {
            write!(f, "{} ({})", self.host, self.ip_string)
        }
    }
}

/// A 128-bit random token embedded in every outbound payload.
///
/// Replies whose payload does not start with the session's fingerprint
/// belong to a different ping session sharing the host's network stack and
/// are discarded without comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; Fingerprint::LEN]);

impl Fingerprint {
    /// Fingerprint length in bytes, and therefore the payload-size floor.
    pub const LEN: usize = 16;

    /// Generate a fresh random fingerprint
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

/// The 16-bit session identifier echoed in the ICMP identifier field.
///
/// Distinguishes this session's conversation from other ICMP users on the
/// same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The paired probe counters.
///
/// `wire` is the 16-bit sequence number that goes into the ICMP header and
/// wraps to 0 after 65535; `logical` is the unbounded probe count. Both move
/// together, so `wire == logical mod 65536` holds at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    wire: u16,
    logical: u64,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current wire-level sequence number
    pub fn wire(&self) -> u16 {
        self.wire
    }

    /// Current logical probe index
    pub fn logical(&self) -> u64 {
        self.logical
    }

    /// Advance both counters by one probe
    pub fn advance(&mut self) {
        self.wire = self.wire.wrapping_add(1);
        self.logical = self.logical.wrapping_add(1);
    }

    /// Reset both counters to zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Unix timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_display() {
        let by_name = Destination::new("ping.example.net", Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(by_name.ip_string, "192.0.2.7");
        assert_eq!(by_name.to_string(), "ping.example.net (192.0.2.7)");

        let by_literal = Destination::new("192.0.2.7", Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(by_literal.to_string(), "192.0.2.7");
    }

    #[test]
    fn test_fingerprints_are_distinct() {
        // Collisions on 128 random bits would point at a broken generator
        let a = Fingerprint::generate();
        let b = Fingerprint::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), Fingerprint::LEN);
    }

    #[test]
    fn test_counters_move_together() {
        let mut counters = SequenceCounters::new();
        assert_eq!(counters.wire(), 0);
        assert_eq!(counters.logical(), 0);

        for _ in 0..3 {
            counters.advance();
        }
        assert_eq!(counters.wire(), 3);
        assert_eq!(counters.logical(), 3);

        counters.reset();
        assert_eq!(counters.wire(), 0);
        assert_eq!(counters.logical(), 0);
    }

    #[test]
    fn test_wire_counter_wraps_while_logical_continues() {
        let mut counters = SequenceCounters::new();
        for _ in 0..65536 {
            counters.advance();
        }
        assert_eq!(counters.wire(), 0);
        assert_eq!(counters.logical(), 65536);

        counters.advance();
        assert_eq!(counters.wire(), 1);
        assert_eq!(counters.logical(), 65537);
        assert_eq!(counters.wire() as u64, counters.logical() % 65536);
    }
}
