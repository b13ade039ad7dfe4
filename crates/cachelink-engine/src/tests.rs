//! Engine tests against scripted transport and cache stubs.
//!
//! The two-node end-to-end scenarios live in `cachelink-sim`; these
//! tests pin down single-engine behaviour: request building, reply
//! handling, timeout and late-reply semantics, cancellation, peer
//! death, and the responder's dispatch and fast path.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use cachelink_types::{reason, CacheKey, Digest, FragType, HttpInfo, ResultCode, SeqNo};
use cachelink_types::PeerId;
use cachelink_wire::{decode_message, Body, DataMsg, OpReply, Opcode, ReplyFlags};

use crate::cache::{CacheBackend, CacheEvent, CacheVcId, ContId, RemoveOptions, WriteOptions};
use crate::engine::{CallerEvent, ClusterCache, OpArgs};
use crate::transport::{
    EventMask, FnCode, Priority, SessionEvent, SessionId, SessionTransport, TransportError,
};
use crate::EngineConfig;

// ======================================================================
// Stub transport
// ======================================================================

#[derive(Default)]
struct NetState {
    next_sid: u64,
    sent: Vec<(SessionId, FnCode, Bytes, Priority)>,
    events: VecDeque<(SessionId, SessionEvent)>,
    closed: Vec<SessionId>,
    peers: HashMap<u64, PeerId>,
    masks: HashMap<u64, EventMask>,
    fail_send: bool,
    fail_create: bool,
}

#[derive(Clone, Default)]
struct StubNet(Rc<RefCell<NetState>>);

impl StubNet {
    fn push_message(&self, sid: SessionId, fn_code: FnCode, payload: Bytes) {
        self.0
            .borrow_mut()
            .events
            .push_back((sid, SessionEvent::Message { fn_code, payload }));
    }

    fn sent(&self) -> Vec<(SessionId, FnCode, Bytes, Priority)> {
        self.0.borrow().sent.clone()
    }

    fn last_sent(&self) -> (SessionId, FnCode, Bytes, Priority) {
        self.0.borrow().sent.last().cloned().expect("something sent")
    }

    fn closed(&self) -> Vec<SessionId> {
        self.0.borrow().closed.clone()
    }
}

impl SessionTransport for StubNet {
    fn create_session(&mut self, peer: PeerId) -> Result<SessionId, TransportError> {
        let mut st = self.0.borrow_mut();
        if st.fail_create {
            return Err(TransportError::PeerUnreachable(peer));
        }
        st.next_sid += 1;
        let sid = SessionId(st.next_sid);
        st.peers.insert(sid.0, peer);
        Ok(sid)
    }

    fn peer_of(&self, session: SessionId) -> Option<PeerId> {
        self.0.borrow().peers.get(&session.0).copied()
    }

    fn send(
        &mut self,
        session: SessionId,
        fn_code: FnCode,
        chain: Vec<Bytes>,
        _deadline: Option<Duration>,
        priority: Priority,
    ) -> Result<(), TransportError> {
        let mut st = self.0.borrow_mut();
        if st.fail_send {
            return Err(TransportError::SendRejected("stubbed failure"));
        }
        for payload in chain {
            st.sent.push((session, fn_code, payload, priority));
        }
        Ok(())
    }

    fn set_events(&mut self, session: SessionId, mask: EventMask) {
        self.0.borrow_mut().masks.insert(session.0, mask);
    }

    fn close(&mut self, session: SessionId) -> bool {
        let mut st = self.0.borrow_mut();
        if st.closed.contains(&session) {
            return false;
        }
        st.closed.push(session);
        true
    }

    fn poll_events(&mut self) -> Vec<(SessionId, SessionEvent)> {
        self.0.borrow_mut().events.drain(..).collect()
    }
}

// ======================================================================
// Stub cache backend
// ======================================================================

#[derive(Default)]
struct CacheState {
    calls: Vec<String>,
    events: VecDeque<(ContId, CacheEvent)>,
    read_chunks: HashMap<u64, VecDeque<Bytes>>,
    object_size: u64,
    read_from_writer: bool,
    io_done: HashMap<u64, u64>,
    appended: HashMap<u64, Vec<Bytes>>,
    http: HashMap<u64, HttpInfo>,
    closed: Vec<(u64, Option<i32>)>,
    cancelled: Vec<u64>,
}

#[derive(Clone, Default)]
struct StubCache(Rc<RefCell<CacheState>>);

impl StubCache {
    fn complete(&self, cont: ContId, event: CacheEvent) {
        self.0.borrow_mut().events.push_back((cont, event));
    }

    fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    fn closed(&self) -> Vec<(u64, Option<i32>)> {
        self.0.borrow().closed.clone()
    }

    fn serve_read(&self, vc: CacheVcId, chunks: Vec<Bytes>) {
        self.0
            .borrow_mut()
            .read_chunks
            .insert(vc.0, chunks.into_iter().collect());
    }
}

impl CacheBackend for StubCache {
    fn open_read(&mut self, _cont: ContId, key: &CacheKey, _hostname: &[u8]) {
        self.0.borrow_mut().calls.push(format!("open_read {}", key.digest));
    }

    fn open_read_http(
        &mut self,
        _cont: ContId,
        key: &CacheKey,
        _http_request: &Bytes,
        _lookup_config: &Bytes,
        _hostname: &[u8],
    ) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("open_read_http {}", key.digest));
    }

    fn open_write(&mut self, _cont: ContId, key: &CacheKey, opts: &WriteOptions, _hostname: &[u8]) {
        self.0.borrow_mut().calls.push(format!(
            "open_write {} overwrite={}",
            key.digest, opts.overwrite
        ));
    }

    fn remove(&mut self, _cont: ContId, key: &CacheKey, _opts: &RemoveOptions, _hostname: &[u8]) {
        self.0.borrow_mut().calls.push(format!("remove {}", key.digest));
    }

    fn link(&mut self, _cont: ContId, from: &CacheKey, to: &CacheKey, _hostname: &[u8]) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("link {} {}", from.digest, to.digest));
    }

    fn deref(&mut self, _cont: ContId, key: &CacheKey, _hostname: &[u8]) {
        self.0.borrow_mut().calls.push(format!("deref {}", key.digest));
    }

    fn cancel(&mut self, cont: ContId) {
        self.0.borrow_mut().cancelled.push(cont.0);
    }

    fn vc_object_size(&self, _vc: CacheVcId) -> u64 {
        self.0.borrow().object_size
    }

    fn vc_open_flags(&self, _vc: CacheVcId) -> u32 {
        0
    }

    fn vc_is_read_from_writer(&self, _vc: CacheVcId) -> bool {
        self.0.borrow().read_from_writer
    }

    fn vc_get_http_info(&self, vc: CacheVcId) -> Option<HttpInfo> {
        self.0.borrow().http.get(&vc.0).cloned()
    }

    fn vc_set_http_info(&mut self, vc: CacheVcId, info: HttpInfo) {
        self.0.borrow_mut().http.insert(vc.0, info);
    }

    fn vc_do_io_read(&mut self, _cont: ContId, vc: CacheVcId, nbytes: u64) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("do_io_read vc={} n={}", vc.0, nbytes));
    }

    fn vc_do_io_pread(&mut self, _cont: ContId, vc: CacheVcId, nbytes: u64, offset: u64) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("do_io_pread vc={} n={} off={}", vc.0, nbytes, offset));
    }

    fn vc_do_io_write(&mut self, _cont: ContId, vc: CacheVcId, nbytes: u64) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("do_io_write vc={} n={}", vc.0, nbytes));
    }

    fn vc_append(&mut self, vc: CacheVcId, data: Bytes) {
        let mut st = self.0.borrow_mut();
        let n = data.len() as u64;
        st.appended.entry(vc.0).or_default().push(data);
        *st.io_done.entry(vc.0).or_default() += n;
    }

    fn vc_take_read(&mut self, vc: CacheVcId) -> Bytes {
        self.0
            .borrow_mut()
            .read_chunks
            .get_mut(&vc.0)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default()
    }

    fn vc_reenable(&mut self, vc: CacheVcId) {
        self.0.borrow_mut().calls.push(format!("reenable vc={}", vc.0));
    }

    fn vc_set_io_nbytes(&mut self, vc: CacheVcId, nbytes: u64) {
        self.0
            .borrow_mut()
            .calls
            .push(format!("set_io_nbytes vc={} n={}", vc.0, nbytes));
    }

    fn vc_io_done(&self, vc: CacheVcId) -> u64 {
        self.0.borrow().io_done.get(&vc.0).copied().unwrap_or(0)
    }

    fn vc_do_io_close(&mut self, vc: CacheVcId, reason: Option<i32>) {
        self.0.borrow_mut().closed.push((vc.0, reason));
    }

    fn poll_events(&mut self) -> Vec<(ContId, CacheEvent)> {
        self.0.borrow_mut().events.drain(..).collect()
    }
}

// ======================================================================
// Harness helpers
// ======================================================================

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<CallerEvent>>>);

impl Recorder {
    fn callback(&self) -> Box<dyn crate::OpCallback> {
        let events = Rc::clone(&self.0);
        Box::new(move |ev: CallerEvent| events.borrow_mut().push(ev))
    }

    fn len(&self) -> usize {
        self.0.borrow().len()
    }

    fn with<R>(&self, f: impl FnOnce(&[CallerEvent]) -> R) -> R {
        f(&self.0.borrow())
    }
}

struct Rig {
    engine: ClusterCache,
    net: StubNet,
    cache: StubCache,
    t0: Instant,
}

fn rig(config: EngineConfig) -> Rig {
    let net = StubNet::default();
    let cache = StubCache::default();
    let t0 = Instant::now();
    let engine = ClusterCache::new(
        config,
        Box::new(net.clone()),
        Box::new(cache.clone()),
        t0,
    );
    Rig {
        engine,
        net,
        cache,
        t0,
    }
}

fn digest(b: u8) -> Digest {
    Digest::from_bytes([b; 16])
}

fn key(b: u8) -> CacheKey {
    CacheKey::new(digest(b), FragType::Http)
}

fn read_args(b: u8) -> OpArgs {
    OpArgs::ReadHttp {
        key: key(b),
        http_request: Bytes::from_static(b"GET /"),
        lookup_config: Bytes::from_static(b"cfg"),
        hostname: Bytes::from_static(b"origin"),
        conditional: false,
        purge: false,
    }
}

// ======================================================================
// Initiator tests
// ======================================================================

#[test]
fn test_do_op_sends_request_and_registers() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x11), r.t0)
        .expect("op started");

    let (sid, fn_code, payload, prio) = r.net.last_sent();
    assert_eq!(fn_code, FnCode::CacheOp);
    assert_eq!(prio, Priority::High);
    assert_eq!(sid, SessionId(1));

    let (hdr, body) = decode_message(payload).unwrap();
    assert_eq!(hdr.opcode, Opcode::OpenReadLong);
    let Body::Long(msg) = body else {
        panic!("expected long op");
    };
    assert_eq!(msg.digest, digest(0x11));
    assert!(!msg.seqno.is_none());

    assert_eq!(r.engine.initiator_count(), 1);
    assert_eq!(r.engine.vc_digest(action.vc), Some(digest(0x11)));
    assert_eq!(rec.len(), 0);
}

#[test]
fn test_do_op_send_failure_returns_none() {
    let mut r = rig(EngineConfig::default());
    r.net.0.borrow_mut().fail_send = true;
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x22), r.t0);
    assert!(action.is_none());
    assert_eq!(r.engine.initiator_count(), 0);
    // The session opened for the attempt is closed again.
    assert_eq!(r.net.closed(), vec![SessionId(1)]);
    assert_eq!(rec.len(), 0);
}

fn reply_for(sent: &Bytes, result: ResultCode, reason_code: i32, data: Bytes) -> OpReply {
    let (_, body) = decode_message(sent.clone()).unwrap();
    let seqno = match body {
        Body::Long(m) => m.seqno,
        Body::Short(m) => m.seqno,
        Body::Short2(m) => m.seqno,
        _ => panic!("not a request"),
    };
    OpReply {
        seqno,
        result,
        flags: ReplyFlags::empty(),
        reason: reason_code,
        doc_size: data.len() as u64,
        http_info: Bytes::new(),
        data,
    }
}

#[test]
fn test_inlined_read_reply_delivers_data_then_eos() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x33), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    let body = Bytes::from(vec![0xAB; 1800]);
    let reply = reply_for(&sent, ResultCode::OpenRead, 0, body.clone());
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0);

    rec.with(|evs| {
        assert_eq!(evs.len(), 1);
        assert!(matches!(
            evs[0],
            CallerEvent::OpenRead { doc_size: 1800, .. }
        ));
    });

    // Drive the VC like a caller: request, take, reenable.
    r.engine.vc_do_io_read(action.vc, 1800).unwrap();
    rec.with(|evs| assert!(matches!(evs[1], CallerEvent::ReadReady { .. })));
    let got = r.engine.vc_take_read(action.vc).unwrap();
    assert_eq!(got, body);
    r.engine.vc_reenable(action.vc).unwrap();
    rec.with(|evs| assert!(matches!(evs[2], CallerEvent::ReadEos { .. })));

    r.engine.vc_do_io_close(action.vc, None).unwrap();
    assert_eq!(r.engine.initiator_count(), 0);
    assert!(r.net.closed().contains(&sid));
}

#[test]
fn test_zero_length_object_reports_clean_eos() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x34), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    let reply = reply_for(&sent, ResultCode::OpenRead, 0, Bytes::new());
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0);

    r.engine.vc_do_io_read(action.vc, 0).unwrap();
    rec.with(|evs| {
        assert!(matches!(evs[0], CallerEvent::OpenRead { doc_size: 0, .. }));
        assert!(matches!(evs[1], CallerEvent::ReadEos { .. }));
    });
}

#[test]
fn test_timeout_then_late_reply_is_dropped() {
    let config = EngineConfig::default().with_cluster_timeout(Duration::from_millis(100));
    let mut r = rig(config);
    let rec = Recorder::default();

    let _action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x44), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    // Deadline fires at 100ms.
    r.engine.pump(r.t0 + Duration::from_millis(100));
    rec.with(|evs| {
        assert_eq!(evs.len(), 1);
        assert!(matches!(
            evs[0],
            CallerEvent::OpenReadFailed {
                reason: reason::CLUSTER_OP_TIMEOUT,
                ..
            }
        ));
    });
    // The record lingers so the late reply has somewhere to die.
    assert_eq!(r.engine.initiator_count(), 1);

    // Reply lands at 150ms: dropped, no second callback, record freed.
    let reply = reply_for(&sent, ResultCode::OpenRead, 0, Bytes::from_static(b"late"));
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0 + Duration::from_millis(150));

    assert_eq!(rec.len(), 1);
    assert_eq!(r.engine.initiator_count(), 0);
    assert!(r.net.closed().contains(&sid));
}

#[test]
fn test_cancel_suppresses_callback() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x55), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    r.engine.cancel(action).unwrap();

    let reply = reply_for(&sent, ResultCode::OpenRead, 0, Bytes::from_static(b"x"));
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0);

    assert_eq!(rec.len(), 0);
    assert_eq!(r.engine.initiator_count(), 0);
    assert!(r.net.closed().contains(&sid));
}

#[test]
fn test_peer_death_fails_outstanding_ops() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    for b in [1u8, 2, 3] {
        r.engine
            .do_op(rec.callback(), PeerId::new(9), read_args(b), r.t0)
            .unwrap();
    }
    assert_eq!(r.engine.initiator_count(), 3);

    r.engine.peer_died(PeerId::new(9), r.t0);

    assert_eq!(rec.len(), 3);
    rec.with(|evs| {
        for ev in evs {
            assert!(matches!(
                ev,
                CallerEvent::OpenReadFailed {
                    reason: reason::CLUSTER_NO_MACHINE,
                    ..
                }
            ));
        }
    });
    assert_eq!(r.engine.initiator_count(), 0);
    assert_eq!(r.net.closed().len(), 3);
}

#[test]
fn test_failure_reply_surfaces_reason() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    r.engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x66), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    let reply = reply_for(
        &sent,
        ResultCode::OpenReadFailed,
        reason::CACHE_NO_DOC,
        Bytes::new(),
    );
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0);

    rec.with(|evs| {
        assert!(matches!(
            evs[0],
            CallerEvent::OpenReadFailed {
                reason: reason::CACHE_NO_DOC,
                ..
            }
        ));
    });
    assert_eq!(r.engine.initiator_count(), 0);
}

#[test]
fn test_salvage_reply_parks_vc_in_reuse_cache() {
    let mut r = rig(EngineConfig::default());
    let rec = Recorder::default();

    let action = r
        .engine
        .do_op(rec.callback(), PeerId::new(2), read_args(0x77), r.t0)
        .unwrap();
    let (sid, _, sent, _) = r.net.last_sent();

    let mut reply = reply_for(
        &sent,
        ResultCode::OpenReadFailed,
        reason::CACHE_NO_DOC,
        Bytes::new(),
    );
    reply.flags = ReplyFlags::WRITE_TOKEN;
    r.net.push_message(sid, FnCode::CacheOpResult, reply.encode());
    r.engine.pump(r.t0);

    // The caller sees the read failure...
    rec.with(|evs| {
        assert!(matches!(evs[0], CallerEvent::OpenReadFailed { .. }));
    });
    // ...but the record survives as a parked write VC.
    assert_eq!(r.engine.initiator_count(), 1);

    // A later long open-write for the same digest resolves locally.
    let rec2 = Recorder::default();
    let write = r
        .engine
        .do_op(
            rec2.callback(),
            PeerId::new(2),
            OpArgs::WriteHttp {
                key: key(0x77),
                old_info: None,
                pin_time: 0,
                hostname: Bytes::new(),
            },
            r.t0,
        )
        .unwrap();
    assert_eq!(write.vc, action.vc);
    rec2.with(|evs| assert!(matches!(evs[0], CallerEvent::OpenWrite { .. })));
    // No second request went out.
    assert_eq!(
        r.net
            .sent()
            .iter()
            .filter(|(_, f, _, _)| *f == FnCode::CacheOp)
            .count(),
        1
    );
}

// ======================================================================
// Responder tests
// ======================================================================

fn inbound_read(r: &mut Rig, b: u8) -> SessionId {
    let sid = SessionId(700 + u64::from(b));
    r.net.0.borrow_mut().peers.insert(sid.0, PeerId::new(1));
    let msg = cachelink_wire::LongOp {
        digest: digest(b),
        frag: FragType::Http,
        seqno: SeqNo::from_wire(9000 + u32::from(b)),
        nbytes: 0,
        pin_time: 0,
        buffer_hint: 32768,
        http_blob: Bytes::from_static(b"GET /"),
        lookup_blob: Bytes::from_static(b"cfg"),
        hostname: Bytes::from_static(b"origin"),
    }
    .encode(Opcode::OpenReadLong, cachelink_types::OpFlags::empty());
    r.net.push_message(sid, FnCode::CacheOp, msg);
    sid
}

#[test]
fn test_responder_dispatches_open_read() {
    let mut r = rig(EngineConfig::default());
    inbound_read(&mut r, 0x10);
    r.engine.pump(r.t0);

    assert_eq!(r.engine.responder_count(), 1);
    let calls = r.cache.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("open_read_http"));
}

#[test]
fn test_responder_small_object_inlined_reply() {
    let mut r = rig(EngineConfig::default().with_small_fragment_threshold(4096));
    let sid = inbound_read(&mut r, 0x11);
    r.engine.pump(r.t0);

    // Local cache opens with an 1800-byte object.
    let vc = CacheVcId(1);
    r.cache.0.borrow_mut().object_size = 1800;
    r.cache
        .0
        .borrow_mut()
        .http
        .insert(vc.0, HttpInfo::new(Bytes::from(vec![b'h'; 312])));
    let cont = ContId(r.engine_cont());
    r.cache.complete(cont, CacheEvent::OpenRead { vc });
    r.cache.serve_read(vc, vec![Bytes::from(vec![0xCD; 1800])]);
    r.engine.pump(r.t0);

    // The fast path issues one read for the whole object.
    assert!(r
        .cache
        .calls()
        .iter()
        .any(|c| c.starts_with("do_io_read vc=1 n=1800")));

    r.cache.complete(cont, CacheEvent::ReadComplete);
    r.engine.pump(r.t0);

    // Reply carries the marshaled info and the whole object.
    let (rsid, fn_code, payload, prio) = r.net.last_sent();
    assert_eq!(rsid, sid);
    assert_eq!(fn_code, FnCode::CacheOpResult);
    assert_eq!(prio, Priority::Mid);
    let (_, body) = decode_message(payload).unwrap();
    let Body::Reply(reply) = body else {
        panic!("expected reply");
    };
    assert_eq!(reply.result, ResultCode::OpenRead);
    assert_eq!(reply.doc_size, 1800);
    assert_eq!(reply.data.len(), 1800);
    assert!(!reply.http_info.is_empty());

    // Terminal: VC closed exactly once, session closed, record freed.
    assert_eq!(r.cache.closed(), vec![(1, None)]);
    assert!(r.net.closed().contains(&sid));
    assert_eq!(r.engine.responder_count(), 0);
}

#[test]
fn test_responder_threshold_object_streams() {
    let mut r = rig(EngineConfig::default().with_small_fragment_threshold(4096));
    let sid = inbound_read(&mut r, 0x12);
    r.engine.pump(r.t0);

    // Exactly at the threshold: must stream, not inline.
    let vc = CacheVcId(1);
    r.cache.0.borrow_mut().object_size = 4096;
    let cont = ContId(r.engine_cont());
    r.cache.complete(cont, CacheEvent::OpenRead { vc });
    r.engine.pump(r.t0);

    let (rsid, fn_code, payload, _) = r.net.last_sent();
    assert_eq!(rsid, sid);
    assert_eq!(fn_code, FnCode::CacheOpResult);
    let (_, body) = decode_message(payload).unwrap();
    let Body::Reply(reply) = body else {
        panic!("expected reply");
    };
    assert_eq!(reply.result, ResultCode::OpenRead);
    assert_eq!(reply.doc_size, 4096);
    assert!(reply.data.is_empty());

    // Record stays for the stream; nothing read yet.
    assert_eq!(r.engine.responder_count(), 1);
    assert!(!r.cache.calls().iter().any(|c| c.starts_with("do_io_read")));
}

#[test]
fn test_responder_remove_replies_and_closes() {
    let mut r = rig(EngineConfig::default());
    let sid = SessionId(801);
    r.net.0.borrow_mut().peers.insert(sid.0, PeerId::new(1));
    let msg = cachelink_wire::ShortOp {
        digest: digest(0x13),
        frag: FragType::Generic,
        seqno: SeqNo::from_wire(31),
        nbytes: 0,
        data: 0,
        buffer_hint: 0,
        hostname: Bytes::new(),
    }
    .encode(Opcode::Remove, cachelink_types::OpFlags::empty());
    r.net.push_message(sid, FnCode::CacheOp, msg);
    r.engine.pump(r.t0);

    let cont = ContId(r.engine_cont());
    r.cache.complete(cont, CacheEvent::RemoveDone);
    r.engine.pump(r.t0);

    let (_, fn_code, payload, _) = r.net.last_sent();
    assert_eq!(fn_code, FnCode::CacheOpResult);
    let (_, body) = decode_message(payload).unwrap();
    let Body::Reply(reply) = body else {
        panic!("expected reply");
    };
    assert_eq!(reply.result, ResultCode::Remove);
    assert!(r.net.closed().contains(&sid));
    assert_eq!(r.engine.responder_count(), 0);
}

#[test]
fn test_responder_write_begin_bad_http_info_aborts() {
    let mut r = rig(EngineConfig::default());
    let sid = SessionId(802);
    r.net.0.borrow_mut().peers.insert(sid.0, PeerId::new(1));
    let msg = cachelink_wire::ShortOp {
        digest: digest(0x14),
        frag: FragType::Http,
        seqno: SeqNo::from_wire(32),
        nbytes: 500,
        data: 0,
        buffer_hint: 0,
        hostname: Bytes::new(),
    }
    .encode(Opcode::OpenWrite, cachelink_types::OpFlags::empty());
    r.net.push_message(sid, FnCode::CacheOp, msg);
    r.engine.pump(r.t0);

    let vc = CacheVcId(5);
    let cont = ContId(r.engine_cont());
    r.cache.complete(cont, CacheEvent::OpenWrite { vc });
    r.engine.pump(r.t0);

    // A write begin with garbage where the marshaled info should be.
    let frame = DataMsg::WriteBegin {
        nbytes: 500,
        http_info: Bytes::from_static(b"not marshaled"),
    };
    r.net.push_message(sid, FnCode::CacheData, frame.encode());
    r.engine.pump(r.t0);

    // The initiator is told, and the VC is closed with the HTTP error.
    let errors = r
        .net
        .sent()
        .iter()
        .filter(|(_, f, p, _)| {
            *f == FnCode::CacheData
                && matches!(
                    decode_message(p.clone()),
                    Ok((_, Body::Data(DataMsg::Error { .. })))
                )
        })
        .count();
    assert_eq!(errors, 1);
    assert_eq!(r.cache.closed(), vec![(5, Some(reason::HTTP_ERROR))]);
    assert!(r.net.closed().contains(&sid));
    assert_eq!(r.engine.responder_count(), 0);
}

impl Rig {
    fn engine_cont(&self) -> u64 {
        // Stub convention: the first responder record allocated by a
        // fresh engine gets id 1.
        1
    }
}
