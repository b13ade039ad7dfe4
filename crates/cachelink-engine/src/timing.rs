//! Deadlines and scheduled rescheduling.
//!
//! Two small primitives replace the original's ad-hoc timed
//! continuations: a deadline table for per-operation timeouts, and a
//! retry queue that re-runs an action after a back-off when a striped
//! lock was contended. Neither spins; both are polled from the engine's
//! event pump with an explicit `now`.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

/// Per-key deadlines, scanned on poll.
#[derive(Debug)]
pub struct Deadlines<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Copy> Deadlines<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Arms (or re-arms) a deadline.
    pub fn arm(&mut self, key: K, at: Instant) {
        self.deadlines.insert(key, at);
    }

    /// Cancels a deadline; harmless if none is armed.
    pub fn cancel(&mut self, key: &K) {
        self.deadlines.remove(key);
    }

    /// Removes and returns every key whose deadline has passed.
    pub fn fired(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| *k)
            .collect();
        for k in &expired {
            self.deadlines.remove(k);
        }
        expired
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for Deadlines<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Actions deferred to a later poll, typically after a lock miss.
#[derive(Debug)]
pub struct RetryQueue<A> {
    pending: Vec<(Instant, A)>,
}

impl<A> RetryQueue<A> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Schedules `action` to run at or after `due`.
    pub fn push(&mut self, due: Instant, action: A) {
        self.pending.push((due, action));
    }

    /// Removes and returns every action whose time has come.
    pub fn due(&mut self, now: Instant) -> Vec<A> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 <= now {
                ready.push(self.pending.swap_remove(i).1);
            } else {
                i += 1;
            }
        }
        ready
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<A> Default for RetryQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timing_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deadlines_fire_in_order_of_poll() {
        let t0 = Instant::now();
        let mut d: Deadlines<u64> = Deadlines::new();
        d.arm(1, t0 + Duration::from_millis(100));
        d.arm(2, t0 + Duration::from_millis(200));

        assert!(d.fired(t0 + Duration::from_millis(50)).is_empty());

        let fired = d.fired(t0 + Duration::from_millis(150));
        assert_eq!(fired, vec![1]);

        let fired = d.fired(t0 + Duration::from_millis(250));
        assert_eq!(fired, vec![2]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let t0 = Instant::now();
        let mut d: Deadlines<u64> = Deadlines::new();
        d.arm(1, t0 + Duration::from_millis(10));
        d.cancel(&1);
        assert!(d.fired(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_retry_queue_releases_due_actions() {
        let t0 = Instant::now();
        let mut q: RetryQueue<&'static str> = RetryQueue::new();
        q.push(t0 + Duration::from_millis(10), "a");
        q.push(t0 + Duration::from_millis(30), "b");

        assert!(q.due(t0).is_empty());
        assert_eq!(q.due(t0 + Duration::from_millis(20)), vec!["a"]);
        assert_eq!(q.due(t0 + Duration::from_millis(40)), vec!["b"]);
        assert!(q.is_empty());
    }
}
