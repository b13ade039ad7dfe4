//! The per-thread engine instance: record tables, event pump, and
//! dispatch.
//!
//! One [`ClusterCache`] runs per event thread. Records (initiator VCs and
//! responder ops) are pinned to their engine; the sequence registry, the
//! write-VC reuse cache, and the sequence number generator are shared
//! across the process via [`SharedTables`].
//!
//! The pump is explicit: the embedding loop calls [`ClusterCache::pump`]
//! with the current time, and the engine drains transport events, cache
//! events, fired deadlines, and deferred retries in that order. Caller
//! callbacks are invoked from inside the pump and must not reenter the
//! engine; they record what happened and the embedding loop acts on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use cachelink_types::{CacheKey, Digest, HttpInfo, PeerId, SeqNo, SeqNoGen};
use cachelink_wire::{decode_message, Body, Opcode};

use crate::cache::{CacheBackend, ContId, RemoveOptions};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::initiator::InitiatorOp;
use crate::metrics::metrics;
use crate::responder::ResponderOp;
use crate::seqreg::SequenceRegistry;
use crate::timing::{Deadlines, RetryQueue};
use crate::transport::{FnCode, SessionEvent, SessionId, SessionTransport};
use crate::vccache::{Sweep, WriteVcCache};

/// Handle to an initiator-side virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcId(pub u64);

/// Handle to a responder-side operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

/// Caller-visible action handle, used only for cancellation.
#[derive(Debug, Clone, Copy)]
pub struct OpAction {
    pub vc: VcId,
}

/// Events delivered to the caller continuation of a remote operation.
///
/// After an open succeeds, the caller drives the VC named in the event
/// through the engine's `vc_*` methods.
#[derive(Debug)]
pub enum CallerEvent {
    OpenRead {
        vc: VcId,
        doc_size: u64,
        http_info: Option<HttpInfo>,
    },
    OpenReadFailed {
        vc: VcId,
        reason: i32,
    },
    OpenWrite {
        vc: VcId,
    },
    OpenWriteFailed {
        vc: VcId,
        reason: i32,
    },
    RemoveDone {
        vc: VcId,
    },
    RemoveFailed {
        vc: VcId,
        reason: i32,
    },
    LinkDone {
        vc: VcId,
    },
    LinkFailed {
        vc: VcId,
        reason: i32,
    },
    DerefDone {
        vc: VcId,
    },
    DerefFailed {
        vc: VcId,
        reason: i32,
    },
    UpdateFailed {
        vc: VcId,
        reason: i32,
    },
    /// Read data is available via `vc_take_read`.
    ReadReady {
        vc: VcId,
    },
    /// The read stream ended cleanly.
    ReadEos {
        vc: VcId,
    },
    /// The stream failed mid-flight.
    VcError {
        vc: VcId,
        reason: i32,
    },
}

/// Caller continuation for a remote cache operation.
///
/// Callbacks run inside the engine pump and must not call back into the
/// engine; record the event and act from the embedding loop.
pub trait OpCallback {
    fn on_event(&mut self, event: CallerEvent);
}

impl<F: FnMut(CallerEvent)> OpCallback for F {
    fn on_event(&mut self, event: CallerEvent) {
        self(event)
    }
}

/// Arguments for a remote cache operation; the variant selects the
/// opcode and wire shape.
#[derive(Debug, Clone)]
pub enum OpArgs {
    /// Generic open-read (short form).
    Read { key: CacheKey, hostname: Bytes },
    /// HTTP open-read (long form) with marshaled request state.
    ReadHttp {
        key: CacheKey,
        http_request: Bytes,
        lookup_config: Bytes,
        hostname: Bytes,
        /// The request carries conditional headers.
        conditional: bool,
        /// The request is a purge; suppresses read-to-write salvage.
        purge: bool,
    },
    /// Generic open-write (short form).
    Write {
        key: CacheKey,
        nbytes: u64,
        pin_time: u32,
        overwrite: bool,
        hostname: Bytes,
    },
    /// HTTP open-write (long form), optionally updating existing info.
    WriteHttp {
        key: CacheKey,
        old_info: Option<HttpInfo>,
        pin_time: u32,
        hostname: Bytes,
    },
    /// Header-only update of an existing object.
    Update {
        key: CacheKey,
        pin_time: u32,
        hostname: Bytes,
    },
    Remove {
        key: CacheKey,
        opts: RemoveOptions,
        hostname: Bytes,
    },
    Link {
        from: CacheKey,
        to: CacheKey,
        hostname: Bytes,
    },
    Deref { key: CacheKey, hostname: Bytes },
}

impl OpArgs {
    /// Wire opcode for this operation.
    pub fn opcode(&self) -> Opcode {
        match self {
            OpArgs::Read { .. } => Opcode::OpenRead,
            OpArgs::ReadHttp { .. } => Opcode::OpenReadLong,
            OpArgs::Write { .. } => Opcode::OpenWrite,
            OpArgs::WriteHttp { .. } => Opcode::OpenWriteLong,
            OpArgs::Update { .. } => Opcode::Update,
            OpArgs::Remove { .. } => Opcode::Remove,
            OpArgs::Link { .. } => Opcode::Link,
            OpArgs::Deref { .. } => Opcode::Deref,
        }
    }

    /// The primary cache key addressed by this operation.
    pub fn key(&self) -> CacheKey {
        match self {
            OpArgs::Read { key, .. }
            | OpArgs::ReadHttp { key, .. }
            | OpArgs::Write { key, .. }
            | OpArgs::WriteHttp { key, .. }
            | OpArgs::Update { key, .. }
            | OpArgs::Remove { key, .. }
            | OpArgs::Deref { key, .. } => *key,
            OpArgs::Link { from, .. } => *from,
        }
    }
}

/// What a session is bound to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Binding {
    Initiator(VcId),
    Responder(OpId),
}

/// Deferred actions re-run after a lock miss or to stagger work.
#[derive(Debug)]
pub(crate) enum RetryAction {
    RegistryInsert {
        peer: PeerId,
        seqno: SeqNo,
        op: u64,
    },
    RegistryRemove {
        peer: PeerId,
        seqno: SeqNo,
    },
    ReuseInsert {
        vc: VcId,
    },
    ReuseProbe {
        vc: VcId,
    },
    SweepBucket {
        idx: usize,
    },
    PeerFanout {
        peer: PeerId,
    },
}

/// Process-wide tables shared by every engine instance.
#[derive(Clone)]
pub struct SharedTables {
    pub seqgen: Arc<SeqNoGen>,
    pub registry: Arc<SequenceRegistry>,
    pub reuse: Arc<WriteVcCache<VcId>>,
}

impl SharedTables {
    pub fn new() -> Self {
        Self {
            seqgen: Arc::new(SeqNoGen::new()),
            registry: Arc::new(SequenceRegistry::new()),
            reuse: Arc::new(WriteVcCache::new()),
        }
    }
}

impl Default for SharedTables {
    fn default() -> Self {
        Self::new()
    }
}

/// The cluster cache RPC engine for one event thread.
pub struct ClusterCache {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Box<dyn SessionTransport>,
    pub(crate) cache: Box<dyn CacheBackend>,
    pub(crate) shared: SharedTables,
    pub(crate) initiators: HashMap<VcId, InitiatorOp>,
    pub(crate) responders: HashMap<OpId, ResponderOp>,
    pub(crate) bindings: HashMap<SessionId, Binding>,
    pub(crate) deadlines: Deadlines<VcId>,
    pub(crate) retries: RetryQueue<RetryAction>,
    next_id: u64,
    next_scan: Instant,
}

impl ClusterCache {
    /// Creates an engine with its own private shared tables.
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn SessionTransport>,
        cache: Box<dyn CacheBackend>,
        now: Instant,
    ) -> Self {
        Self::with_shared(config, transport, cache, SharedTables::new(), now)
    }

    /// Creates an engine sharing registries with other engines in the
    /// process.
    pub fn with_shared(
        config: EngineConfig,
        transport: Box<dyn SessionTransport>,
        cache: Box<dyn CacheBackend>,
        shared: SharedTables,
        now: Instant,
    ) -> Self {
        let next_scan = now + config.scan_interval;
        Self {
            config,
            transport,
            cache,
            shared,
            initiators: HashMap::new(),
            responders: HashMap::new(),
            bindings: HashMap::new(),
            deadlines: Deadlines::new(),
            retries: RetryQueue::new(),
            next_id: 1,
            next_scan,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn unbind(&mut self, session: SessionId) {
        self.bindings.remove(&session);
    }

    /// Drives the engine: drains transport and cache events, fires
    /// deadlines, runs deferred retries, and schedules reuse-cache
    /// sweeps.
    pub fn pump(&mut self, now: Instant) {
        for (session, event) in self.transport.poll_events() {
            self.on_session_event(session, event, now);
        }

        for (cont, event) in self.cache.poll_events() {
            self.responder_cache_event(OpId(cont.0), event, now);
        }

        for vc in self.deadlines.fired(now) {
            self.initiator_timeout(vc, now);
        }

        for action in self.retries.due(now) {
            self.run_retry(action, now);
        }

        if now >= self.next_scan {
            self.next_scan = now + self.config.scan_interval;
            for idx in 0..self.shared.reuse.bucket_count() {
                self.run_sweep(idx, now);
            }
        }
    }

    fn on_session_event(&mut self, session: SessionId, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Message { fn_code, payload } => {
                if let Err(e) = self.on_message(session, fn_code, payload, now) {
                    warn!(?session, error = %e, "closing session on dispatch error");
                    self.session_failed(session, now);
                }
            }
            SessionEvent::PeerDead | SessionEvent::Closed => {
                trace!(?session, "session closed by transport");
                self.session_failed(session, now);
            }
        }
    }

    fn on_message(
        &mut self,
        session: SessionId,
        fn_code: FnCode,
        payload: Bytes,
        now: Instant,
    ) -> EngineResult<()> {
        match fn_code {
            FnCode::CacheOp => {
                if self.bindings.contains_key(&session) {
                    return Err(EngineError::Protocol("cache op on bound session"));
                }
                self.responder_cache_op(session, payload, now)
            }
            FnCode::CacheOpResult => {
                let (hdr, body) = decode_message(payload)?;
                debug_assert_eq!(hdr.opcode, Opcode::OpResult);
                let Body::Reply(reply) = body else {
                    return Err(EngineError::Protocol("malformed reply body"));
                };
                match self.bindings.get(&session) {
                    Some(Binding::Initiator(vc)) => {
                        let vc = *vc;
                        self.initiator_reply(vc, reply, now);
                        Ok(())
                    }
                    _ => {
                        // Session already gone: late reply with nobody
                        // waiting.
                        metrics().late_replies.inc();
                        self.transport.close(session);
                        Ok(())
                    }
                }
            }
            FnCode::CacheData => {
                let (hdr, body) = decode_message(payload)?;
                let Body::Data(frame) = body else {
                    return Err(EngineError::Protocol("malformed data frame"));
                };
                trace!(?session, opcode = ?hdr.opcode, "data frame");
                match self.bindings.get(&session) {
                    Some(Binding::Initiator(vc)) => {
                        let vc = *vc;
                        self.initiator_frame(vc, frame, now);
                        Ok(())
                    }
                    Some(Binding::Responder(op)) => {
                        let op = *op;
                        self.responder_frame(op, frame, now);
                        Ok(())
                    }
                    None => Err(EngineError::UnboundSession),
                }
            }
        }
    }

    /// Tears down whatever record a failed session was bound to.
    fn session_failed(&mut self, session: SessionId, now: Instant) {
        match self.bindings.get(&session) {
            Some(Binding::Initiator(vc)) => {
                let vc = *vc;
                self.initiator_session_failed(vc, now);
            }
            Some(Binding::Responder(op)) => {
                let op = *op;
                self.responder_session_failed(op);
            }
            None => {
                self.transport.close(session);
            }
        }
    }

    /// Fails every outstanding operation targeting `peer`.
    ///
    /// Invoked by the membership layer when it declares a peer dead. The
    /// sequence registry provides the fan-out; streaming records (no
    /// longer registered) are failed by their sessions' own dead events.
    pub fn peer_died(&mut self, peer: PeerId, now: Instant) {
        debug!(%peer, "peer died, failing outstanding operations");
        let (ops, complete) = self.shared.registry.fail_peer(peer);
        for op in ops {
            self.initiator_peer_gone(VcId(op), now);
        }
        if !complete {
            self.retries
                .push(now + self.config.retry_period, RetryAction::PeerFanout { peer });
        }
    }

    fn run_retry(&mut self, action: RetryAction, now: Instant) {
        match action {
            RetryAction::RegistryInsert { peer, seqno, op } => {
                // Only reinsert while the op is still waiting for its
                // reply.
                if self
                    .initiators
                    .get(&VcId(op))
                    .is_some_and(|r| r.awaiting_reply())
                {
                    if let crate::seqreg::RegOutcome::Retry =
                        self.shared.registry.insert(peer, seqno, op)
                    {
                        self.retries.push(
                            now + self.config.retry_period,
                            RetryAction::RegistryInsert { peer, seqno, op },
                        );
                    } else if let Some(rec) = self.initiators.get_mut(&VcId(op)) {
                        rec.registered = true;
                    }
                }
            }
            RetryAction::RegistryRemove { peer, seqno } => {
                if let crate::seqreg::RegOutcome::Retry = self.shared.registry.remove(peer, seqno) {
                    self.retries.push(
                        now + self.config.retry_period,
                        RetryAction::RegistryRemove { peer, seqno },
                    );
                }
            }
            RetryAction::ReuseInsert { vc } => {
                self.retry_reuse_insert(vc, now);
            }
            RetryAction::ReuseProbe { vc } => {
                self.retry_reuse_probe(vc, now);
            }
            RetryAction::SweepBucket { idx } => {
                self.run_sweep(idx, now);
            }
            RetryAction::PeerFanout { peer } => {
                self.peer_died(peer, now);
            }
        }
    }

    fn run_sweep(&mut self, idx: usize, now: Instant) {
        match self.shared.reuse.sweep(idx) {
            Sweep::Purged(vcs) => {
                for vc in vcs {
                    self.close_salvaged(vc);
                }
            }
            Sweep::Retry => {
                self.retries
                    .push(now + self.config.retry_period, RetryAction::SweepBucket { idx });
            }
        }
    }

    /// Number of live initiator records. Debugging and tests.
    pub fn initiator_count(&self) -> usize {
        self.initiators.len()
    }

    /// Number of live responder records. Debugging and tests.
    pub fn responder_count(&self) -> usize {
        self.responders.len()
    }

    /// Looks up the digest an initiator record addresses. Tests.
    pub fn vc_digest(&self, vc: VcId) -> Option<Digest> {
        self.initiators.get(&vc).map(|r| r.key.digest)
    }
}

/// Internal continuation-id helper: responder records double as cache
/// continuations.
pub(crate) fn cont_of(op: OpId) -> ContId {
    ContId(op.0)
}
