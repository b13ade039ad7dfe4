//! Registry of outstanding remote operations.
//!
//! Operations are bucketed by a fold of `(peer, seqno)`; each bucket has
//! its own mutex and is only ever try-locked, so the registry can never
//! stall an event thread. A lock miss surfaces as [`Retry`] and the
//! caller reschedules itself after the configured retry period.
//!
//! The registry exists for two things the session binding cannot do:
//! peer-death fan-out, and telling a late reply from an expected one.

use std::sync::Mutex;

use cachelink_types::{PeerId, SeqNo};

/// Number of hash buckets. Power of two.
pub const REGISTRY_BUCKETS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    peer: PeerId,
    seqno: SeqNo,
    op: u64,
}

/// Result of a lookup-and-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    /// The entry existed and has been removed.
    Taken(u64),
    /// No such entry; the reply is late or the op was never registered.
    Missing,
    /// Bucket lock contended; retry later.
    Retry,
}

/// Result of an insert or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOutcome {
    Done,
    Retry,
}

/// Striped registry of `(peer, seqno) → op` for outstanding operations.
#[derive(Debug)]
pub struct SequenceRegistry {
    buckets: Vec<Mutex<Vec<Entry>>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(REGISTRY_BUCKETS);
        for _ in 0..REGISTRY_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        Self { buckets }
    }

    fn bucket(peer: PeerId, seqno: SeqNo) -> usize {
        let f = peer.as_u64() ^ u64::from(seqno.as_u32());
        ((f >> 32) ^ (f & 0xFFFF_FFFF)) as usize & (REGISTRY_BUCKETS - 1)
    }

    /// Registers an outstanding operation.
    pub fn insert(&self, peer: PeerId, seqno: SeqNo, op: u64) -> RegOutcome {
        debug_assert!(!seqno.is_none());
        let Ok(mut bucket) = self.buckets[Self::bucket(peer, seqno)].try_lock() else {
            return RegOutcome::Retry;
        };
        bucket.push(Entry { peer, seqno, op });
        RegOutcome::Done
    }

    /// Removes and returns the operation registered under `(peer, seqno)`.
    pub fn take(&self, peer: PeerId, seqno: SeqNo) -> Take {
        let Ok(mut bucket) = self.buckets[Self::bucket(peer, seqno)].try_lock() else {
            return Take::Retry;
        };
        match bucket
            .iter()
            .position(|e| e.peer == peer && e.seqno == seqno)
        {
            Some(i) => Take::Taken(bucket.swap_remove(i).op),
            None => Take::Missing,
        }
    }

    /// Removes an entry without caring whether it was present.
    pub fn remove(&self, peer: PeerId, seqno: SeqNo) -> RegOutcome {
        match self.take(peer, seqno) {
            Take::Retry => RegOutcome::Retry,
            _ => RegOutcome::Done,
        }
    }

    /// Broadcast removal for a dead peer.
    ///
    /// Collects the ops from every bucket it could lock; `complete` is
    /// false when at least one bucket was contended and the sweep must be
    /// retried.
    pub fn fail_peer(&self, peer: PeerId) -> (Vec<u64>, bool) {
        let mut ops = Vec::new();
        let mut complete = true;
        for bucket in &self.buckets {
            let Ok(mut bucket) = bucket.try_lock() else {
                complete = false;
                continue;
            };
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].peer == peer {
                    ops.push(bucket.swap_remove(i).op);
                } else {
                    i += 1;
                }
            }
        }
        (ops, complete)
    }

    /// Number of registered operations. Debugging and tests only; takes
    /// every bucket lock.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().map(|v| v.len()).unwrap_or(0))
            .sum()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SequenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod seqreg_tests {
    use super::*;

    fn seq(n: u32) -> SeqNo {
        SeqNo::from_wire(n)
    }

    #[test]
    fn test_insert_take_roundtrip() {
        let reg = SequenceRegistry::new();
        let peer = PeerId::new(7);

        assert_eq!(reg.insert(peer, seq(1), 100), RegOutcome::Done);
        assert_eq!(reg.take(peer, seq(1)), Take::Taken(100));
        assert_eq!(reg.take(peer, seq(1)), Take::Missing);
    }

    #[test]
    fn test_take_discriminates_peers() {
        let reg = SequenceRegistry::new();
        reg.insert(PeerId::new(1), seq(5), 10);
        reg.insert(PeerId::new(2), seq(5), 20);

        assert_eq!(reg.take(PeerId::new(2), seq(5)), Take::Taken(20));
        assert_eq!(reg.take(PeerId::new(1), seq(5)), Take::Taken(10));
    }

    #[test]
    fn test_fail_peer_collects_only_that_peer() {
        let reg = SequenceRegistry::new();
        let dead = PeerId::new(3);
        let alive = PeerId::new(4);
        for n in 1..=10u32 {
            reg.insert(dead, seq(n), u64::from(n));
            reg.insert(alive, seq(n), u64::from(100 + n));
        }

        let (mut ops, complete) = reg.fail_peer(dead);
        assert!(complete);
        ops.sort_unstable();
        assert_eq!(ops, (1u32..=10).map(u64::from).collect::<Vec<_>>());
        assert_eq!(reg.len(), 10);
    }

    #[test]
    fn test_contended_bucket_reports_retry() {
        let reg = SequenceRegistry::new();
        let peer = PeerId::new(9);
        let idx = SequenceRegistry::bucket(peer, seq(42));

        let _held = reg.buckets[idx].lock().unwrap();
        assert_eq!(reg.insert(peer, seq(42), 1), RegOutcome::Retry);
        assert_eq!(reg.take(peer, seq(42)), Take::Retry);

        let (ops, complete) = reg.fail_peer(peer);
        assert!(ops.is_empty());
        assert!(!complete);
    }
}
