//! Two-node cluster harness.
//!
//! Wires two engines, their in-memory caches, and a shared simulated
//! network into one deterministic unit that tests can step explicitly.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use cachelink_engine::{CallerEvent, ClusterCache, EngineConfig, OpCallback};
use cachelink_types::PeerId;

use crate::memcache::MemCache;
use crate::net::{SimNet, SimNetConfig};

/// One simulated node: an engine plus its local cache.
pub struct Node {
    pub id: PeerId,
    pub engine: ClusterCache,
    pub cache: MemCache,
}

/// A two-node cluster over a simulated network.
pub struct Cluster {
    pub net: SimNet,
    pub a: Node,
    pub b: Node,
}

impl Cluster {
    /// Builds a cluster with the same engine configuration on both
    /// nodes.
    pub fn new(config: EngineConfig, seed: u64, now: Instant) -> Self {
        Self::with_net_config(config, SimNetConfig::reliable(), seed, now)
    }

    pub fn with_net_config(
        config: EngineConfig,
        net_config: SimNetConfig,
        seed: u64,
        now: Instant,
    ) -> Self {
        let net = SimNet::with_config(seed, net_config);
        let a = Self::node(&net, PeerId::new(1), config.clone(), now);
        let b = Self::node(&net, PeerId::new(2), config, now);
        Self { net, a, b }
    }

    fn node(net: &SimNet, id: PeerId, config: EngineConfig, now: Instant) -> Node {
        let cache = MemCache::new();
        let engine = ClusterCache::new(
            config,
            Box::new(net.handle(id)),
            Box::new(cache.clone()),
            now,
        );
        Node { id, engine, cache }
    }

    /// Pumps both engines until the network and caches go quiet.
    pub fn run(&mut self, now: Instant) {
        for _ in 0..1024 {
            self.a.engine.pump(now);
            self.b.engine.pump(now);
            if self.net.is_idle() && !self.a.cache.has_pending() && !self.b.cache.has_pending() {
                break;
            }
        }
    }

    /// Pumps one round without waiting for quiescence.
    pub fn step(&mut self, now: Instant) {
        self.a.engine.pump(now);
        self.b.engine.pump(now);
    }
}

/// Records caller events for later assertions.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<CallerEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a callback that appends into this recorder.
    pub fn callback(&self) -> Box<dyn OpCallback> {
        let events = Rc::clone(&self.events);
        Box::new(move |ev: CallerEvent| events.borrow_mut().push(ev))
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the recorded events.
    pub fn with<R>(&self, f: impl FnOnce(&[CallerEvent]) -> R) -> R {
        f(&self.events.borrow())
    }

    /// Removes and returns all recorded events.
    pub fn drain(&self) -> Vec<CallerEvent> {
        self.events.borrow_mut().drain(..).collect()
    }
}
