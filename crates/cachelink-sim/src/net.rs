//! Simulated session transport.
//!
//! `SimNet` models the cluster transport for a set of in-process nodes:
//! sessions are FIFO frame queues between two endpoints, data-frame
//! delivery honours the receiver's notification mask (one frame per
//! enable, converting push to pull), high-priority frames jump the
//! queue, and peer death drops undelivered frames the way a crashed
//! process would.
//!
//! All behaviour is deterministic for a given seed and call sequence.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use cachelink_engine::transport::{
    EventMask, FnCode, Priority, SessionEvent, SessionId, SessionTransport, TransportError,
};
use cachelink_types::PeerId;

/// Configuration for simulated transport behaviour.
#[derive(Debug, Clone)]
pub struct SimNetConfig {
    /// Probability of dropping a low-priority data frame.
    pub drop_probability: f64,
}

impl Default for SimNetConfig {
    fn default() -> Self {
        Self {
            drop_probability: 0.0,
        }
    }
}

impl SimNetConfig {
    /// A fully reliable network.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// A network that loses a fraction of its bulk data frames.
    pub fn lossy(drop_probability: f64) -> Self {
        Self { drop_probability }
    }
}

#[derive(Debug)]
struct Frame {
    fn_code: FnCode,
    payload: Bytes,
    priority: Priority,
}

#[derive(Debug)]
struct SessionState {
    /// Creating endpoint.
    a: PeerId,
    /// Target endpoint.
    b: PeerId,
    to_a: VecDeque<Frame>,
    to_b: VecDeque<Frame>,
    mask_a: EventMask,
    mask_b: EventMask,
    closed_a: bool,
    closed_b: bool,
    /// Terminal event (Closed / PeerDead) already delivered to the side.
    notified_a: bool,
    notified_b: bool,
}

impl SessionState {
    /// Returns `Some(true)` for the creating side, `Some(false)` for the
    /// target side.
    fn side_of(&self, node: PeerId) -> Option<bool> {
        if node == self.a {
            Some(true)
        } else if node == self.b {
            Some(false)
        } else {
            None
        }
    }

    fn finished(&self) -> bool {
        (self.closed_a || self.notified_a) && (self.closed_b || self.notified_b)
    }
}

struct NetInner {
    next_sid: u64,
    sessions: HashMap<u64, SessionState>,
    dead: HashSet<PeerId>,
    /// Seeded generator behind the loss-injection draws: the same seed
    /// and call sequence lose the same frames on every run.
    rng: SmallRng,
    config: SimNetConfig,
    dropped: u64,
}

/// The shared simulated network. Hand a [`NetHandle`] to each engine.
#[derive(Clone)]
pub struct SimNet {
    inner: Rc<RefCell<NetInner>>,
}

impl SimNet {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, SimNetConfig::default())
    }

    pub fn with_config(seed: u64, config: SimNetConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetInner {
                next_sid: 0,
                sessions: HashMap::new(),
                dead: HashSet::new(),
                rng: SmallRng::seed_from_u64(seed),
                config,
                dropped: 0,
            })),
        }
    }

    /// Returns the transport handle for one node.
    pub fn handle(&self, node: PeerId) -> NetHandle {
        NetHandle {
            inner: Rc::clone(&self.inner),
            node,
        }
    }

    /// Kills a node: its endpoints stop answering and undelivered
    /// frames from it are lost.
    pub fn kill(&self, node: PeerId) {
        self.inner.borrow_mut().dead.insert(node);
    }

    /// True when no frames or terminal notifications are pending.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.sessions.values().all(|s| {
            if s.finished() {
                return true;
            }
            let a_pending = !s.closed_a
                && (!s.to_a.is_empty()
                    || ((s.closed_b || inner.dead.contains(&s.b)) && !s.notified_a));
            let b_pending = !s.closed_b
                && (!s.to_b.is_empty()
                    || ((s.closed_a || inner.dead.contains(&s.a)) && !s.notified_b));
            !a_pending && !b_pending
        })
    }

    /// Number of low-priority frames dropped by loss injection.
    pub fn dropped(&self) -> u64 {
        self.inner.borrow().dropped
    }

    /// Number of sessions not yet finished on both sides.
    pub fn open_sessions(&self) -> usize {
        self.inner
            .borrow()
            .sessions
            .values()
            .filter(|s| !s.finished())
            .count()
    }
}

/// Per-node transport handle.
pub struct NetHandle {
    inner: Rc<RefCell<NetInner>>,
    node: PeerId,
}

impl SessionTransport for NetHandle {
    fn create_session(&mut self, peer: PeerId) -> Result<SessionId, TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.dead.contains(&peer) || inner.dead.contains(&self.node) {
            return Err(TransportError::PeerUnreachable(peer));
        }
        inner.next_sid += 1;
        let sid = inner.next_sid;
        inner.sessions.insert(
            sid,
            SessionState {
                a: self.node,
                b: peer,
                to_a: VecDeque::new(),
                to_b: VecDeque::new(),
                mask_a: EventMask::NONE,
                mask_b: EventMask::NONE,
                closed_a: false,
                closed_b: false,
                notified_a: false,
                notified_b: false,
            },
        );
        trace!(sid, from = %self.node, to = %peer, "session created");
        Ok(SessionId(sid))
    }

    fn peer_of(&self, session: SessionId) -> Option<PeerId> {
        let inner = self.inner.borrow();
        let s = inner.sessions.get(&session.0)?;
        match s.side_of(self.node)? {
            true => Some(s.b),
            false => Some(s.a),
        }
    }

    fn send(
        &mut self,
        session: SessionId,
        fn_code: FnCode,
        chain: Vec<Bytes>,
        _deadline: Option<Duration>,
        priority: Priority,
    ) -> Result<(), TransportError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let Some(s) = inner.sessions.get_mut(&session.0) else {
            return Err(TransportError::SessionClosed);
        };
        let Some(is_a) = s.side_of(self.node) else {
            return Err(TransportError::SessionClosed);
        };
        if (is_a && s.closed_a) || (!is_a && s.closed_b) {
            return Err(TransportError::SessionClosed);
        }
        let other = if is_a { s.b } else { s.a };
        if inner.dead.contains(&other) {
            return Err(TransportError::PeerUnreachable(other));
        }

        for payload in chain {
            let lose = inner.config.drop_probability > 0.0
                && fn_code == FnCode::CacheData
                && priority == Priority::Low
                && inner.rng.gen_bool(inner.config.drop_probability.min(1.0));
            if lose {
                inner.dropped += 1;
                continue;
            }
            let queue = if is_a { &mut s.to_b } else { &mut s.to_a };
            queue.push_back(Frame {
                fn_code,
                payload,
                priority,
            });
        }
        Ok(())
    }

    fn set_events(&mut self, session: SessionId, mask: EventMask) {
        let mut inner = self.inner.borrow_mut();
        if let Some(s) = inner.sessions.get_mut(&session.0) {
            match s.side_of(self.node) {
                Some(true) => s.mask_a = mask,
                Some(false) => s.mask_b = mask,
                None => {}
            }
        }
    }

    fn close(&mut self, session: SessionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(s) = inner.sessions.get_mut(&session.0) else {
            return false;
        };
        match s.side_of(self.node) {
            Some(true) if !s.closed_a => {
                s.closed_a = true;
                trace!(sid = session.0, node = %self.node, "session closed");
                true
            }
            Some(false) if !s.closed_b => {
                s.closed_b = true;
                trace!(sid = session.0, node = %self.node, "session closed");
                true
            }
            _ => false,
        }
    }

    fn poll_events(&mut self) -> Vec<(SessionId, SessionEvent)> {
        let mut inner = self.inner.borrow_mut();
        let mut out = Vec::new();

        let mut sids: Vec<u64> = inner.sessions.keys().copied().collect();
        sids.sort_unstable();

        let dead = inner.dead.clone();
        for sid in sids {
            let Some(s) = inner.sessions.get_mut(&sid) else {
                continue;
            };
            let Some(is_a) = s.side_of(self.node) else {
                continue;
            };
            // A side that closed its end neither sends nor receives.
            if (is_a && s.closed_a) || (!is_a && s.closed_b) {
                continue;
            }
            let other = if is_a { s.b } else { s.a };

            // A dead peer loses its undelivered frames.
            if dead.contains(&other) {
                let notified = if is_a { &mut s.notified_a } else { &mut s.notified_b };
                if !*notified {
                    *notified = true;
                    if is_a {
                        s.to_a.clear();
                    } else {
                        s.to_b.clear();
                    }
                    out.push((SessionId(sid), SessionEvent::PeerDead));
                }
                continue;
            }

            // Deliver frames: control always, data by the mask with one
            // frame per enable, high priority jumping the queue.
            loop {
                let (queue, mask) = if is_a {
                    (&mut s.to_a, &mut s.mask_a)
                } else {
                    (&mut s.to_b, &mut s.mask_b)
                };

                let deliverable = |f: &Frame, mask: EventMask| match f.fn_code {
                    FnCode::CacheOp | FnCode::CacheOpResult => true,
                    FnCode::CacheData => {
                        f.priority == Priority::High || mask.contains(EventMask::NOTIFY_DEALER)
                    }
                };

                let idx = if queue.front().is_some_and(|f| deliverable(f, *mask)) {
                    Some(0)
                } else {
                    queue
                        .iter()
                        .position(|f| f.fn_code == FnCode::CacheData && f.priority == Priority::High)
                };
                let Some(idx) = idx else {
                    break;
                };
                let Some(frame) = queue.remove(idx) else {
                    break;
                };
                if frame.fn_code == FnCode::CacheData && frame.priority != Priority::High {
                    // One pulled frame per enable.
                    *mask = EventMask::NONE;
                }
                out.push((
                    SessionId(sid),
                    SessionEvent::Message {
                        fn_code: frame.fn_code,
                        payload: frame.payload,
                    },
                ));
            }

            // The other side closed and everything it sent has been
            // delivered: surface the close once.
            let queue_empty = if is_a { s.to_a.is_empty() } else { s.to_b.is_empty() };
            let other_closed = if is_a { s.closed_b } else { s.closed_a };
            let notified = if is_a { &mut s.notified_a } else { &mut s.notified_b };
            if other_closed && queue_empty && !*notified {
                *notified = true;
                out.push((SessionId(sid), SessionEvent::Closed));
            }
        }

        out
    }
}

#[cfg(test)]
mod net_tests {
    use super::*;

    fn frame() -> Bytes {
        Bytes::from_static(b"payload")
    }

    fn losses_for_seed(seed: u64, sends: usize) -> u64 {
        let net = SimNet::with_config(seed, SimNetConfig::lossy(0.5));
        let mut a = net.handle(PeerId::new(1));
        let sid = a.create_session(PeerId::new(2)).unwrap();
        for _ in 0..sends {
            a.send(sid, FnCode::CacheData, vec![frame()], None, Priority::Low)
                .unwrap();
        }
        net.dropped()
    }

    #[test]
    fn test_loss_is_seed_deterministic() {
        let first = losses_for_seed(42, 256);
        let second = losses_for_seed(42, 256);
        assert_eq!(first, second);
        assert!(first > 0, "a 50% lossy link must lose something");
    }

    #[test]
    fn test_reliable_network_drops_nothing() {
        let net = SimNet::new(7);
        let mut a = net.handle(PeerId::new(1));
        let sid = a.create_session(PeerId::new(2)).unwrap();
        for _ in 0..32 {
            a.send(sid, FnCode::CacheData, vec![frame()], None, Priority::Low)
                .unwrap();
        }
        assert_eq!(net.dropped(), 0);
    }

    #[test]
    fn test_only_bulk_data_is_eligible_for_loss() {
        let net = SimNet::with_config(3, SimNetConfig::lossy(1.0));
        let mut a = net.handle(PeerId::new(1));
        let sid = a.create_session(PeerId::new(2)).unwrap();

        // Requests, replies, and high-priority control survive even a
        // fully lossy link; only the bulk data frame is lost.
        a.send(sid, FnCode::CacheOp, vec![frame()], None, Priority::High)
            .unwrap();
        a.send(sid, FnCode::CacheOpResult, vec![frame()], None, Priority::Mid)
            .unwrap();
        a.send(sid, FnCode::CacheData, vec![frame()], None, Priority::High)
            .unwrap();
        a.send(sid, FnCode::CacheData, vec![frame()], None, Priority::Low)
            .unwrap();
        assert_eq!(net.dropped(), 1);
    }
}
