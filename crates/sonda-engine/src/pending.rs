//! In-flight probe registry
//!
//! Tracks every probe between send and terminal outcome, owns the abort
//! handles of their timeout timers, and remembers which sequence numbers
//! already resolved so late or duplicate datagrams can be told apart from
//! unknown ones.
//!
//! The registry is owned by the session worker and only ever touched from
//! its event loop, which is what makes the reply-vs-timeout race safe: the
//! first path to remove an entry wins, the second finds nothing and does
//! nothing.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::trace;

/// A probe that has been sent and is awaiting a reply or its timeout
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub identifier: u16,
    pub address: Ipv4Addr,
    pub sequence: u16,
    pub true_sequence: u64,
    pub created_at: Instant,
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    pending: HashMap<u16, PendingRequest>,
    timers: HashMap<u16, AbortHandle>,
    resolved: HashSet<u16>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a probe and its timeout timer.
    ///
    /// A wrapped-around sequence number silently supersedes a stale entry
    /// that somehow survived 65536 intervals: the old timer is aborted,
    /// and had it already fired, its event will find no entry and fall
    /// through as a no-op.
    pub fn register(&mut self, request: PendingRequest, timer: AbortHandle) {
        let sequence = request.sequence;
        self.resolved.remove(&sequence);
        if self.pending.insert(sequence, request).is_some() {
            trace!(sequence, "stale pending entry superseded after sequence wrap");
        }
        if let Some(stale) = self.timers.insert(sequence, timer) {
            stale.abort();
        }
    }

    /// Resolve by reply arrival: remove the entry, cancel its timer, mark
    /// the sequence terminal. `None` means there is nothing to correlate
    /// (duplicate reply, or the timeout already claimed it).
    pub fn resolve(&mut self, sequence: u16) -> Option<PendingRequest> {
        let request = self.pending.remove(&sequence)?;
        if let Some(timer) = self.timers.remove(&sequence) {
            timer.abort();
        }
        self.resolved.insert(sequence);
        Some(request)
    }

    /// Resolve by timer expiry. `None` when a reply won the race.
    pub fn timeout(&mut self, sequence: u16) -> Option<PendingRequest> {
        let request = self.pending.remove(&sequence)?;
        self.timers.remove(&sequence);
        self.resolved.insert(sequence);
        Some(request)
    }

    /// Whether this sequence already reached a terminal outcome
    pub fn was_resolved(&self, sequence: u16) -> bool {
        self.resolved.contains(&sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Abort every timer and drop all in-flight entries. The resolved set
    /// survives so that late datagrams keep being recognized as stale.
    pub fn clear(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.pending.clear();
    }

    /// `clear` plus forgetting the resolved history; pairs with a sequence
    /// counter reset.
    pub fn reset(&mut self) {
        self.clear();
        self.resolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sequence: u16, true_sequence: u64) -> PendingRequest {
        PendingRequest {
            identifier: 0x1111,
            address: Ipv4Addr::new(192, 0, 2, 1),
            sequence,
            true_sequence,
            created_at: Instant::now(),
        }
    }

    fn timer() -> AbortHandle {
        tokio::spawn(std::future::pending::<()>()).abort_handle()
    }

    #[tokio::test]
    async fn test_reply_wins_then_timeout_is_noop() {
        let mut registry = PendingRegistry::new();
        registry.register(request(1, 1), timer());

        let resolved = registry.resolve(1).unwrap();
        assert_eq!(resolved.true_sequence, 1);
        assert!(registry.was_resolved(1));

        // The racing timer fires afterwards and must find nothing
        assert!(registry.timeout(1).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_wins_then_reply_is_discarded() {
        let mut registry = PendingRegistry::new();
        registry.register(request(2, 2), timer());

        assert!(registry.timeout(2).is_some());
        assert!(registry.resolve(2).is_none());
        assert!(registry.was_resolved(2));
    }

    #[tokio::test]
    async fn test_wrap_supersedes_stale_entry() {
        let mut registry = PendingRegistry::new();
        registry.register(request(7, 7), timer());
        // 65536 probes later the wire sequence comes around again
        registry.register(request(7, 65543), timer());

        let resolved = registry.resolve(7).unwrap();
        assert_eq!(resolved.true_sequence, 65543);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_reopens_resolved_sequence() {
        let mut registry = PendingRegistry::new();
        registry.register(request(3, 3), timer());
        registry.resolve(3);
        assert!(registry.was_resolved(3));

        registry.register(request(3, 65539), timer());
        assert!(!registry.was_resolved(3));
    }

    #[tokio::test]
    async fn test_clear_keeps_resolved_history() {
        let mut registry = PendingRegistry::new();
        registry.register(request(1, 1), timer());
        registry.register(request(2, 2), timer());
        registry.resolve(1);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.was_resolved(1));
        assert!(!registry.was_resolved(2));

        registry.reset();
        assert!(!registry.was_resolved(1));
    }
}
