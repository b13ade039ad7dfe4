//! Write-VC reuse cache.
//!
//! When a remote open-read fails and the responder managed to open a
//! write instead, the initiator salvages the established write VC and
//! parks it here, keyed by the content digest. A subsequent open-write
//! for the same digest on this node then resolves locally with no RPC.
//!
//! Entries are weakly held: a background sweep runs per bucket on the
//! scan interval and implements a two-pass generational purge. An entry
//! not marked is marked on the first pass; a marked entry is handed back
//! to the owner on the next, to be closed with remote close allowed.
//!
//! This is a node-global table. Buckets are individually locked and only
//! ever try-locked; contention surfaces as `Retry` and the caller
//! reschedules.

use std::sync::Mutex;

use cachelink_types::Digest;

use crate::metrics::metrics;

/// Number of hash buckets. Must be a power of two.
pub const VC_CACHE_BUCKETS: usize = 256;

#[derive(Debug)]
struct Entry<V> {
    digest: Digest,
    vc: V,
    marked: bool,
}

/// Result of a reuse-cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Entry found and removed; the VC is now the caller's.
    Hit(V),
    /// No entry under this digest.
    Miss,
    /// Bucket lock contended; retry later.
    Retry,
}

/// Result of a reuse-cache insert.
#[derive(Debug, PartialEq, Eq)]
pub enum Insert<V> {
    /// Inserted; if the digest was already present the displaced VC is
    /// returned for the caller to close.
    Ok(Option<V>),
    /// Bucket lock contended; retry later.
    Retry,
}

/// Result of a bucket sweep.
#[derive(Debug, PartialEq, Eq)]
pub enum Sweep<V> {
    /// Entries that survived two scans unhit; the caller closes them.
    Purged(Vec<V>),
    /// Bucket lock contended; retry with a short back-off.
    Retry,
}

/// Digest-keyed cache of salvaged open-write VCs.
#[derive(Debug)]
pub struct WriteVcCache<V> {
    buckets: Vec<Mutex<Vec<Entry<V>>>>,
}

impl<V> WriteVcCache<V> {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(VC_CACHE_BUCKETS);
        for _ in 0..VC_CACHE_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        Self { buckets }
    }

    /// Number of buckets; sweeps address buckets by index.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Looks up and removes the entry for `digest`.
    pub fn lookup(&self, digest: &Digest) -> Lookup<V> {
        let idx = digest.bucket(VC_CACHE_BUCKETS);
        let Ok(mut bucket) = self.buckets[idx].try_lock() else {
            metrics().vc_cache_lookup_lock_misses.inc();
            return Lookup::Retry;
        };
        match bucket.iter().position(|e| e.digest == *digest) {
            Some(i) => {
                let entry = bucket.swap_remove(i);
                metrics().vc_cache_lookup_hits.inc();
                Lookup::Hit(entry.vc)
            }
            None => {
                metrics().vc_cache_lookup_misses.inc();
                Lookup::Miss
            }
        }
    }

    /// Inserts a salvaged VC under `digest`, displacing any previous
    /// entry for the same digest.
    pub fn insert(&self, digest: Digest, vc: V) -> Insert<V> {
        let idx = digest.bucket(VC_CACHE_BUCKETS);
        let Ok(mut bucket) = self.buckets[idx].try_lock() else {
            metrics().vc_cache_insert_lock_misses.inc();
            return Insert::Retry;
        };
        let displaced = bucket
            .iter()
            .position(|e| e.digest == digest)
            .map(|i| bucket.swap_remove(i).vc);
        bucket.push(Entry {
            digest,
            vc,
            marked: false,
        });
        metrics().vc_cache_inserts.inc();
        Insert::Ok(displaced)
    }

    /// Runs one generational purge pass over a bucket.
    pub fn sweep(&self, bucket_idx: usize) -> Sweep<V> {
        metrics().vc_cache_scans.inc();
        let Ok(mut bucket) = self.buckets[bucket_idx].try_lock() else {
            metrics().vc_cache_scan_lock_misses.inc();
            return Sweep::Retry;
        };
        let mut purged = Vec::new();
        let mut i = 0;
        while i < bucket.len() {
            if bucket[i].marked {
                purged.push(bucket.swap_remove(i).vc);
                metrics().vc_cache_purges.inc();
            } else {
                bucket[i].marked = true;
                i += 1;
            }
        }
        Sweep::Purged(purged)
    }

    /// Number of cached entries. Debugging and tests only; takes every
    /// bucket lock.
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

impl<V> Default for WriteVcCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod vccache_tests {
    use super::*;

    fn digest(b: u8) -> Digest {
        Digest::from_bytes([b; 16])
    }

    #[test]
    fn test_lookup_hit_removes_entry() {
        let cache: WriteVcCache<u64> = WriteVcCache::new();
        assert_eq!(cache.insert(digest(1), 100), Insert::Ok(None));

        assert_eq!(cache.lookup(&digest(1)), Lookup::Hit(100));
        // A hit removes: the second lookup misses.
        assert_eq!(cache.lookup(&digest(1)), Lookup::Miss);
    }

    #[test]
    fn test_insert_displaces_same_digest() {
        let cache: WriteVcCache<u64> = WriteVcCache::new();
        assert_eq!(cache.insert(digest(2), 1), Insert::Ok(None));
        assert_eq!(cache.insert(digest(2), 2), Insert::Ok(Some(1)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&digest(2)), Lookup::Hit(2));
    }

    #[test]
    fn test_two_pass_generational_purge() {
        let cache: WriteVcCache<u64> = WriteVcCache::new();
        cache.insert(digest(3), 30);
        let idx = digest(3).bucket(VC_CACHE_BUCKETS);

        // First pass marks, purges nothing.
        assert_eq!(cache.sweep(idx), Sweep::Purged(vec![]));
        assert_eq!(cache.len(), 1);

        // Second pass purges the marked entry.
        assert_eq!(cache.sweep(idx), Sweep::Purged(vec![30]));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_between_scans_rescues_entry() {
        let cache: WriteVcCache<u64> = WriteVcCache::new();
        cache.insert(digest(4), 40);
        let idx = digest(4).bucket(VC_CACHE_BUCKETS);

        assert_eq!(cache.sweep(idx), Sweep::Purged(vec![]));
        assert_eq!(cache.lookup(&digest(4)), Lookup::Hit(40));

        // Re-inserted entries start unmarked again.
        cache.insert(digest(4), 41);
        assert_eq!(cache.sweep(idx), Sweep::Purged(vec![]));
        assert_eq!(cache.sweep(idx), Sweep::Purged(vec![41]));
    }

    #[test]
    fn test_contention_reports_retry() {
        let cache: WriteVcCache<u64> = WriteVcCache::new();
        let idx = digest(5).bucket(VC_CACHE_BUCKETS);
        let _held = cache.buckets[idx].lock().unwrap();

        assert_eq!(cache.lookup(&digest(5)), Lookup::Retry);
        assert_eq!(cache.insert(digest(5), 1), Insert::Retry);
        assert_eq!(cache.sweep(idx), Sweep::Retry);
    }
}
