//! Responder state machine: the serving side of a remote cache
//! operation.
//!
//! The first inbound frame of a session creates a responder record: the
//! payload is copied out of the transport, parsed, and dispatched to the
//! local cache with a per-opcode continuation. Replies go back at MID
//! priority; object data streams at LOW with explicit reenables; errors
//! jump the queue at HIGH.
//!
//! Every terminal path closes the session before the record is freed,
//! and the local cache VC is opened at most once and closed exactly
//! once.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use cachelink_types::{reason, CacheKey, Digest, FragType, HttpInfo, OpFlags, ResultCode, SeqNo};
use cachelink_wire::{decode_message, Body, DataMsg, MsgHeader, OpReply, Opcode, ReplyFlags};

use crate::cache::{CacheEvent, CacheVcId, RemoveOptions, WriteOptions};
use crate::engine::{cont_of, Binding, ClusterCache, OpId};
use crate::error::{EngineError, EngineResult};
use crate::metrics::metrics;
use crate::stream::StreamFlow;
use crate::transport::{EventMask, FnCode, Priority, SessionId};

/// States of a responder record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponderState {
    /// Local cache call outstanding.
    CacheOpen,
    /// Read failed; salvage open-write outstanding.
    SalvageOpen,
    /// Reading a small object whole for the inlined reply.
    SmallRead,
    /// Streaming object data to the initiator.
    StreamRead,
    /// Receiving write payload from the initiator.
    StreamWrite,
    /// Writer aborted; draining one more inbound frame before freeing.
    Draining,
}

/// Responder-side operation record.
pub(crate) struct ResponderOp {
    pub session: SessionId,
    pub opcode: Opcode,
    pub frag: FragType,
    pub digest: Digest,
    pub seqno: SeqNo,
    pub flags: OpFlags,
    /// Zero sequence number: perform the op but send no reply.
    pub no_reply: bool,
    pub pin_time: u32,
    pub hostname: Bytes,
    pub state: ResponderState,
    pub cache_vc: Option<CacheVcId>,
    pub vc_info: Option<HttpInfo>,
    pub doc_size: u64,
    pub flow: StreamFlow,
    pub writer_aborted: bool,
    /// Collected object data for the inlined-reply fast path.
    pub small_buf: BytesMut,
    /// Read-failure reason preserved across the salvage attempt.
    pub read_reason: i32,
}

impl ResponderOp {
    fn new(session: SessionId, opcode: Opcode, hdr: &MsgHeader) -> Self {
        Self {
            session,
            opcode,
            frag: FragType::Generic,
            digest: Digest::from_bytes([0; 16]),
            seqno: SeqNo::NONE,
            flags: hdr.flags,
            no_reply: false,
            pin_time: 0,
            hostname: Bytes::new(),
            state: ResponderState::CacheOpen,
            cache_vc: None,
            vc_info: None,
            doc_size: 0,
            flow: StreamFlow::new(),
            writer_aborted: false,
            small_buf: BytesMut::new(),
            read_reason: 0,
        }
    }

    fn key(&self) -> CacheKey {
        CacheKey::new(self.digest, self.frag)
    }
}

impl ClusterCache {
    // ==================================================================
    // Inbound dispatch
    // ==================================================================

    /// Handles the first frame of a session: unmarshals the request,
    /// allocates the record, and issues the local cache call.
    pub(crate) fn responder_cache_op(
        &mut self,
        session: SessionId,
        payload: Bytes,
        _now: Instant,
    ) -> EngineResult<()> {
        let (hdr, body) = decode_message(payload)?;
        if !hdr.opcode.is_cache_op() {
            return Err(EngineError::Protocol("unexpected opcode for cache op"));
        }

        let id = OpId(self.alloc_id());
        let mut rec = ResponderOp::new(session, hdr.opcode, &hdr);
        let cont = cont_of(id);

        metrics().responder_ops_active.inc();
        self.bindings.insert(session, Binding::Responder(id));

        match (hdr.opcode, body) {
            (Opcode::OpenRead, Body::Short(msg)) => {
                rec.init_short(&msg);
                debug!(?id, seqno = %rec.seqno, "open read");
                let key = rec.key();
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.open_read(cont, &key, &hostname);
            }
            (Opcode::OpenReadLong, Body::Long(msg)) => {
                rec.init_long(&msg);
                debug!(?id, seqno = %rec.seqno, "open read long");
                let key = rec.key();
                let hostname = rec.hostname.clone();
                let http_request = msg.http_blob.clone();
                let lookup = msg.lookup_blob.clone();
                self.responders.insert(id, rec);
                self.cache
                    .open_read_http(cont, &key, &http_request, &lookup, &hostname);
            }
            (Opcode::OpenWrite, Body::Short(msg)) => {
                rec.init_short(&msg);
                rec.pin_time = msg.data;
                debug!(?id, seqno = %rec.seqno, "open write");
                let key = rec.key();
                let opts = WriteOptions {
                    overwrite: rec.flags.contains(OpFlags::OVERWRITE),
                    allow_multiple: rec.flags.contains(OpFlags::ALLOW_MULTIPLE_WRITES),
                    pin_time: rec.pin_time,
                    old_info: None,
                };
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.open_write(cont, &key, &opts, &hostname);
            }
            (Opcode::OpenWriteLong, Body::Long(msg)) => {
                rec.init_long(&msg);
                debug!(?id, seqno = %rec.seqno, "open write long");

                let old_info = if rec.flags.contains(OpFlags::HAVE_OLDINFO)
                    && !msg.http_blob.is_empty()
                {
                    match HttpInfo::unmarshal(msg.http_blob.clone()) {
                        Ok(info) => Some(info),
                        Err(e) => {
                            warn!(?id, error = %e, "old http info unmarshal failed");
                            rec.state = ResponderState::CacheOpen;
                            self.responders.insert(id, rec);
                            self.responder_reply_failure(
                                id,
                                ResultCode::OpenWriteFailed,
                                reason::HTTP_ERROR,
                            );
                            return Ok(());
                        }
                    }
                } else {
                    None
                };

                let key = rec.key();
                let opts = WriteOptions {
                    overwrite: rec.flags.contains(OpFlags::OVERWRITE),
                    allow_multiple: rec.flags.contains(OpFlags::ALLOW_MULTIPLE_WRITES),
                    pin_time: rec.pin_time,
                    old_info,
                };
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.open_write(cont, &key, &opts, &hostname);
            }
            (Opcode::Update, Body::Short(msg)) => {
                rec.init_short(&msg);
                rec.pin_time = msg.data;
                debug!(?id, seqno = %rec.seqno, "update");
                let key = rec.key();
                let opts = WriteOptions {
                    overwrite: true,
                    allow_multiple: false,
                    pin_time: rec.pin_time,
                    old_info: None,
                };
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.open_write(cont, &key, &opts, &hostname);
            }
            (Opcode::Remove, Body::Short(msg)) => {
                rec.init_short(&msg);
                debug!(?id, seqno = %rec.seqno, "remove");
                let key = rec.key();
                let opts = RemoveOptions {
                    user_agents: rec.flags.contains(OpFlags::REMOVE_USER_AGENTS),
                    link: rec.flags.contains(OpFlags::REMOVE_LINK),
                };
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.remove(cont, &key, &opts, &hostname);
            }
            (Opcode::Link, Body::Short2(msg)) => {
                rec.digest = msg.from;
                rec.frag = msg.frag;
                rec.seqno = msg.seqno;
                rec.no_reply = msg.seqno.is_none();
                rec.hostname = msg.hostname.clone();
                debug!(?id, seqno = %rec.seqno, "link");
                let from = rec.key();
                let to = CacheKey::new(msg.to, msg.frag);
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.link(cont, &from, &to, &hostname);
            }
            (Opcode::Deref, Body::Short(msg)) => {
                rec.init_short(&msg);
                debug!(?id, seqno = %rec.seqno, "deref");
                let key = rec.key();
                let hostname = rec.hostname.clone();
                self.responders.insert(id, rec);
                self.cache.deref(cont, &key, &hostname);
            }
            _ => {
                self.unbind(session);
                metrics().responder_ops_active.dec();
                return Err(EngineError::Protocol("request shape does not match opcode"));
            }
        }
        Ok(())
    }

    /// Routes a local cache completion or VIO event to the record's
    /// current state.
    pub(crate) fn responder_cache_event(&mut self, id: OpId, event: CacheEvent, now: Instant) {
        let Some(rec) = self.responders.remove(&id) else {
            return;
        };
        match rec.state {
            ResponderState::CacheOpen => self.responder_open_event(id, rec, event, now),
            ResponderState::SalvageOpen => self.responder_salvage_event(id, rec, event),
            ResponderState::SmallRead => self.responder_small_read_event(id, rec, event),
            ResponderState::StreamRead => self.responder_stream_read_vc_event(id, rec, event),
            ResponderState::StreamWrite | ResponderState::Draining => {
                self.responder_stream_write_vc_event(id, rec, event)
            }
        }
    }

    /// Routes an inbound data frame to the record's current state.
    pub(crate) fn responder_frame(&mut self, id: OpId, frame: DataMsg, _now: Instant) {
        let Some(rec) = self.responders.remove(&id) else {
            return;
        };
        match rec.state {
            ResponderState::StreamRead => self.responder_stream_read_frame(id, rec, frame),
            ResponderState::StreamWrite => self.responder_stream_write_frame(id, rec, frame),
            ResponderState::Draining => {
                trace!(?id, "drained trailing frame after abort");
                self.finish_responder(rec);
            }
            _ => {
                warn!(?id, state = ?rec.state, "data frame before stream start");
                self.responder_abort(rec);
            }
        }
    }

    /// Handles the session dying under a responder record.
    pub(crate) fn responder_session_failed(&mut self, id: OpId) {
        let Some(rec) = self.responders.remove(&id) else {
            return;
        };
        trace!(?id, "responder session failed");
        if rec.state == ResponderState::CacheOpen || rec.state == ResponderState::SalvageOpen {
            self.cache.cancel(cont_of(id));
        }
        self.finish_responder(rec);
    }

    // ==================================================================
    // Open completions
    // ==================================================================

    fn responder_open_event(
        &mut self,
        id: OpId,
        mut rec: ResponderOp,
        event: CacheEvent,
        _now: Instant,
    ) {
        match event {
            CacheEvent::OpenRead { vc } => {
                rec.cache_vc = Some(vc);
                if rec.frag == FragType::Http {
                    rec.vc_info = self.cache.vc_get_http_info(vc);
                }
                rec.doc_size = self.cache.vc_object_size(vc);
                trace!(?id, doc_size = rec.doc_size, "local open read hit");

                let conditional = rec.flags.contains(OpFlags::CONDITIONAL);
                let small = rec.doc_size > 0
                    && rec.doc_size < self.config.small_fragment_threshold
                    && !self.cache.vc_is_read_from_writer(vc)
                    && !conditional;

                if small {
                    rec.state = ResponderState::SmallRead;
                    let cont = cont_of(id);
                    let nbytes = rec.doc_size;
                    self.responders.insert(id, rec);
                    self.cache.vc_do_io_read(cont, vc, nbytes);
                    return;
                }

                // Stream path: reply carries the HTTP info only, then
                // the initiator pulls data with explicit begins and
                // reenables.
                let open_flags = self.cache.vc_open_flags(vc);
                let reply = self.build_reply(
                    &mut rec,
                    ResultCode::OpenRead,
                    open_flags as i32,
                    ReplyFlags::empty(),
                );
                if self.send_reply(&rec, reply).is_err() || rec.doc_size == 0 {
                    self.finish_responder(rec);
                    return;
                }
                rec.state = ResponderState::StreamRead;
                rec.flow.arm();
                self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                self.responders.insert(id, rec);
            }

            CacheEvent::OpenReadFailed { reason: why } => {
                let salvage = self.config.migrate_on_demand
                    && rec.opcode.is_read()
                    && rec.frag == FragType::Http
                    && !rec.flags.contains(OpFlags::PURGE);
                if salvage {
                    // Try to turn the failed read into an established
                    // write before replying, saving the caller a round
                    // trip.
                    debug!(?id, "read miss, attempting write salvage");
                    rec.read_reason = why;
                    rec.state = ResponderState::SalvageOpen;
                    let cont = cont_of(id);
                    let key = rec.key();
                    let opts = WriteOptions {
                        overwrite: false,
                        allow_multiple: false,
                        pin_time: rec.pin_time,
                        old_info: None,
                    };
                    let hostname = rec.hostname.clone();
                    self.responders.insert(id, rec);
                    self.cache.open_write(cont, &key, &opts, &hostname);
                    return;
                }
                self.responders.insert(id, rec);
                self.responder_reply_failure(id, ResultCode::OpenReadFailed, why);
            }

            CacheEvent::OpenWrite { vc } => {
                rec.cache_vc = Some(vc);
                let open_flags = self.cache.vc_open_flags(vc);
                let reply = self.build_reply(
                    &mut rec,
                    ResultCode::OpenWrite,
                    open_flags as i32,
                    ReplyFlags::empty(),
                );
                if self.send_reply(&rec, reply).is_err() {
                    self.finish_responder(rec);
                    return;
                }
                rec.state = ResponderState::StreamWrite;
                rec.flow.arm();
                self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                self.responders.insert(id, rec);
            }

            CacheEvent::OpenWriteFailed { reason: why } => {
                let result = if rec.opcode == Opcode::Update {
                    ResultCode::UpdateFailed
                } else {
                    ResultCode::OpenWriteFailed
                };
                self.responders.insert(id, rec);
                self.responder_reply_failure(id, result, why);
            }

            CacheEvent::RemoveDone => self.responder_terminal_result(id, rec, ResultCode::Remove, 0),
            CacheEvent::RemoveFailed { reason: why } => {
                self.responder_terminal_result(id, rec, ResultCode::RemoveFailed, why)
            }
            CacheEvent::LinkDone => self.responder_terminal_result(id, rec, ResultCode::Link, 0),
            CacheEvent::LinkFailed { reason: why } => {
                self.responder_terminal_result(id, rec, ResultCode::LinkFailed, why)
            }
            CacheEvent::DerefDone => self.responder_terminal_result(id, rec, ResultCode::Deref, 0),
            CacheEvent::DerefFailed { reason: why } => {
                self.responder_terminal_result(id, rec, ResultCode::DerefFailed, why)
            }

            other => {
                warn!(?id, event = ?other, "unexpected cache event during open");
                self.finish_responder(rec);
            }
        }
    }

    /// Open-write completion for the read-miss salvage path.
    fn responder_salvage_event(&mut self, id: OpId, mut rec: ResponderOp, event: CacheEvent) {
        match event {
            CacheEvent::OpenWrite { vc } => {
                debug!(?id, "salvaged write established");
                rec.cache_vc = Some(vc);
                let read_reason = rec.read_reason;
                let reply = self.build_reply(
                    &mut rec,
                    ResultCode::OpenReadFailed,
                    read_reason,
                    ReplyFlags::WRITE_TOKEN,
                );
                if self.send_reply(&rec, reply).is_err() {
                    self.finish_responder(rec);
                    return;
                }
                // The salvaged VC waits for the write stream that the
                // initiator (or a later adopter of its VC) will start.
                rec.state = ResponderState::StreamWrite;
                rec.flow.arm();
                self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                self.responders.insert(id, rec);
            }
            CacheEvent::OpenWriteFailed { .. } => {
                let read_reason = rec.read_reason;
                self.responders.insert(id, rec);
                self.responder_reply_failure(id, ResultCode::OpenReadFailed, read_reason);
            }
            other => {
                warn!(?id, event = ?other, "unexpected cache event during salvage");
                self.finish_responder(rec);
            }
        }
    }

    // ==================================================================
    // Small-object read
    // ==================================================================

    fn responder_small_read_event(&mut self, id: OpId, mut rec: ResponderOp, event: CacheEvent) {
        let Some(vc) = rec.cache_vc else {
            self.finish_responder(rec);
            return;
        };
        match event {
            CacheEvent::ReadReady => {
                let data = self.cache.vc_take_read(vc);
                rec.flow.account(data.len() as u64);
                rec.small_buf.extend_from_slice(&data);
                self.cache.vc_reenable(vc);
                self.responders.insert(id, rec);
            }
            CacheEvent::ReadComplete => {
                let data = self.cache.vc_take_read(vc);
                rec.flow.account(data.len() as u64);
                rec.small_buf.extend_from_slice(&data);
                debug_assert_eq!(rec.flow.done, rec.doc_size);

                let open_flags = self.cache.vc_open_flags(vc);
                metrics().inline_replies.inc();
                let reply = self.build_reply(
                    &mut rec,
                    ResultCode::OpenRead,
                    open_flags as i32,
                    ReplyFlags::empty(),
                );
                let _ = self.send_reply(&rec, reply);
                self.finish_responder(rec);
            }
            CacheEvent::Eos | CacheEvent::Error { .. } => {
                rec.small_buf.clear();
                let why = match event {
                    CacheEvent::Error { reason: r } => r,
                    _ => reason::CACHE_DOC_BUSY,
                };
                self.responders.insert(id, rec);
                self.responder_reply_failure(id, ResultCode::OpenReadFailed, why);
            }
            other => {
                warn!(?id, event = ?other, "unexpected cache event during small read");
                self.finish_responder(rec);
            }
        }
    }

    // ==================================================================
    // Streamed read
    // ==================================================================

    fn responder_stream_read_frame(&mut self, id: OpId, mut rec: ResponderOp, frame: DataMsg) {
        match frame {
            DataMsg::ReadBegin { offset, nbytes } => {
                if !rec.flow.consume() {
                    warn!(?id, "read begin while not expected");
                    self.responder_abort(rec);
                    return;
                }
                let Some(vc) = rec.cache_vc else {
                    self.responder_abort(rec);
                    return;
                };
                trace!(?id, offset, nbytes, "read begin");
                rec.flow.begin(nbytes);
                let cont = cont_of(id);
                self.responders.insert(id, rec);
                self.cache.vc_do_io_pread(cont, vc, nbytes, offset);
            }
            DataMsg::ReadReenable => {
                if !rec.flow.consume() {
                    warn!(?id, "read reenable while not expected");
                    self.responder_abort(rec);
                    return;
                }
                let Some(vc) = rec.cache_vc else {
                    self.responder_abort(rec);
                    return;
                };
                self.responders.insert(id, rec);
                self.cache.vc_reenable(vc);
            }
            DataMsg::Abort | DataMsg::Close { .. } | DataMsg::Error { .. } => {
                self.finish_responder(rec);
            }
            other => {
                warn!(?id, frame = ?other.opcode(), "unexpected frame during read stream");
                self.responder_abort(rec);
            }
        }
    }

    fn responder_stream_read_vc_event(&mut self, id: OpId, mut rec: ResponderOp, event: CacheEvent) {
        let Some(vc) = rec.cache_vc else {
            self.finish_responder(rec);
            return;
        };
        match event {
            CacheEvent::ReadReady | CacheEvent::ReadComplete => {
                let data = self.cache.vc_take_read(vc);
                let n = data.len() as u64;
                rec.flow.account(n);
                metrics().data_bytes_sent.inc_by(n as f64);
                trace!(?id, read = n, total = rec.flow.done, "read done frame");

                let frame = DataMsg::ReadDone { payload: data };
                if self
                    .transport
                    .send(
                        rec.session,
                        FnCode::CacheData,
                        vec![frame.encode()],
                        None,
                        Priority::Low,
                    )
                    .is_err()
                {
                    warn!(?id, "data send failed, dropping stream");
                    self.finish_responder(rec);
                    return;
                }

                if rec.flow.complete() {
                    self.finish_responder(rec);
                    return;
                }
                rec.flow.arm();
                self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                self.responders.insert(id, rec);
            }
            CacheEvent::Eos | CacheEvent::Error { .. } => {
                let why = match event {
                    CacheEvent::Error { reason: r } => r,
                    _ => reason::CACHE_DOC_BUSY,
                };
                let _ = self.transport.send(
                    rec.session,
                    FnCode::CacheData,
                    vec![DataMsg::Error { code: why }.encode()],
                    None,
                    Priority::High,
                );
                self.finish_responder(rec);
            }
            other => {
                warn!(?id, event = ?other, "unexpected cache event during read stream");
                self.finish_responder(rec);
            }
        }
    }

    // ==================================================================
    // Streamed write
    // ==================================================================

    fn responder_stream_write_frame(&mut self, id: OpId, mut rec: ResponderOp, frame: DataMsg) {
        if !matches!(frame, DataMsg::Abort | DataMsg::Error { .. }) && !rec.flow.consume() {
            warn!(?id, frame = ?frame.opcode(), "write frame while not expected");
            self.responder_abort(rec);
            return;
        }
        match frame {
            DataMsg::WriteBegin { nbytes, http_info } => {
                let Some(vc) = rec.cache_vc else {
                    self.responder_abort(rec);
                    return;
                };
                if rec.frag == FragType::Http {
                    if http_info.is_empty() {
                        warn!(?id, "http write begin without http info");
                        self.responder_write_error(rec, reason::HTTP_ERROR);
                        return;
                    }
                    match HttpInfo::unmarshal(http_info) {
                        Ok(info) => self.cache.vc_set_http_info(vc, info),
                        Err(e) => {
                            warn!(?id, error = %e, "http info unmarshal failed");
                            self.responder_write_error(rec, reason::HTTP_ERROR);
                            return;
                        }
                    }
                }
                trace!(?id, nbytes, "write begin");
                rec.flow.begin(nbytes);
                let cont = cont_of(id);
                self.responders.insert(id, rec);
                self.cache.vc_do_io_write(cont, vc, nbytes);
            }

            DataMsg::WriteDone { payload } => {
                if rec.writer_aborted {
                    // The writer died but data was already in flight;
                    // tell the initiator to stop and free.
                    let _ = self.transport.send(
                        rec.session,
                        FnCode::CacheData,
                        vec![DataMsg::Abort.encode()],
                        None,
                        Priority::High,
                    );
                    self.finish_responder(rec);
                    return;
                }
                let Some(vc) = rec.cache_vc else {
                    self.responder_abort(rec);
                    return;
                };
                let n = payload.len() as u64;
                rec.flow.account(n);
                metrics().data_bytes_received.inc_by(n as f64);
                trace!(?id, received = n, total = rec.flow.done, "write done frame");
                self.cache.vc_append(vc, payload);
                self.cache.vc_reenable(vc);
                if !rec.flow.complete() {
                    rec.flow.arm();
                    self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                }
                self.responders.insert(id, rec);
            }

            DataMsg::HeaderOnlyUpdate { http_info } => {
                if rec.writer_aborted {
                    self.finish_responder(rec);
                    return;
                }
                let Some(vc) = rec.cache_vc.take() else {
                    self.responder_abort(rec);
                    return;
                };
                if rec.flow.done != 0 {
                    warn!(?id, "header update after data flowed");
                    rec.cache_vc = Some(vc);
                    self.responder_abort(rec);
                    return;
                }
                if rec.frag == FragType::Http {
                    match HttpInfo::unmarshal(http_info) {
                        Ok(info) => self.cache.vc_set_http_info(vc, info),
                        Err(e) => {
                            warn!(?id, error = %e, "header update unmarshal failed");
                            self.cache.vc_do_io_close(vc, Some(reason::HTTP_ERROR));
                            self.finish_responder(rec);
                            return;
                        }
                    }
                }
                trace!(?id, "header only update");
                self.cache.vc_do_io_close(vc, None);
                self.finish_responder(rec);
            }

            DataMsg::Close { nbytes } => {
                if rec.writer_aborted {
                    self.finish_responder(rec);
                    return;
                }
                let Some(vc) = rec.cache_vc else {
                    self.responder_abort(rec);
                    return;
                };
                trace!(?id, nbytes, done = self.cache.vc_io_done(vc), "stream close");
                rec.flow.nbytes = nbytes;
                self.cache.vc_set_io_nbytes(vc, nbytes);
                if self.cache.vc_io_done(vc) >= nbytes {
                    let vc = rec.cache_vc.take().expect("checked above");
                    self.cache.vc_do_io_close(vc, None);
                    self.finish_responder(rec);
                } else {
                    // The cache is still consuming appended data; wait
                    // for its write-complete.
                    self.cache.vc_reenable(vc);
                    self.responders.insert(id, rec);
                }
            }

            DataMsg::Abort | DataMsg::Error { .. } => {
                self.finish_responder(rec);
            }

            other => {
                warn!(?id, frame = ?other.opcode(), "unexpected frame during write stream");
                self.responder_abort(rec);
            }
        }
    }

    fn responder_stream_write_vc_event(
        &mut self,
        id: OpId,
        mut rec: ResponderOp,
        event: CacheEvent,
    ) {
        match event {
            CacheEvent::WriteReady => {
                if !rec.flow.expect_next && !rec.flow.complete() {
                    rec.flow.arm();
                    self.transport.set_events(rec.session, EventMask::NOTIFY_DEALER);
                }
                self.responders.insert(id, rec);
            }
            CacheEvent::WriteComplete => {
                if let Some(vc) = rec.cache_vc.take() {
                    self.cache.vc_do_io_close(vc, None);
                }
                self.finish_responder(rec);
            }
            CacheEvent::Eos | CacheEvent::Error { .. } => {
                // The local writer aborted. Close the VC with an HTTP
                // error, tell the initiator, and drain one trailing
                // frame if one is still due.
                warn!(?id, "local writer aborted");
                rec.writer_aborted = true;
                if let Some(vc) = rec.cache_vc.take() {
                    self.cache.vc_do_io_close(vc, Some(reason::HTTP_ERROR));
                }
                let _ = self.transport.send(
                    rec.session,
                    FnCode::CacheData,
                    vec![DataMsg::Error {
                        code: reason::HTTP_ERROR,
                    }
                    .encode()],
                    None,
                    Priority::High,
                );
                if rec.flow.expect_next {
                    rec.state = ResponderState::Draining;
                    self.responders.insert(id, rec);
                } else {
                    self.finish_responder(rec);
                }
            }
            other => {
                warn!(?id, event = ?other, "unexpected cache event during write stream");
                self.finish_responder(rec);
            }
        }
    }

    // ==================================================================
    // Replies and teardown
    // ==================================================================

    /// Builds a reply, marshaling the VC's HTTP info and attaching any
    /// collected small-object data.
    fn build_reply(
        &mut self,
        rec: &mut ResponderOp,
        result: ResultCode,
        result_reason: i32,
        flags: ReplyFlags,
    ) -> OpReply {
        let http_info = match (&rec.vc_info, result) {
            (Some(info), ResultCode::OpenRead) => {
                let mut buf = BytesMut::with_capacity(info.marshal_len());
                info.marshal(&mut buf);
                buf.freeze()
            }
            _ => Bytes::new(),
        };
        let data = rec.small_buf.split().freeze();
        OpReply {
            seqno: rec.seqno,
            result,
            flags,
            reason: result_reason,
            doc_size: rec.doc_size,
            http_info,
            data,
        }
    }

    fn send_reply(&mut self, rec: &ResponderOp, reply: OpReply) -> EngineResult<()> {
        if rec.no_reply {
            return Ok(());
        }
        trace!(seqno = %rec.seqno, result = ?reply.result, "sending reply");
        self.transport
            .send(
                rec.session,
                FnCode::CacheOpResult,
                vec![reply.encode()],
                None,
                Priority::Mid,
            )
            .map_err(EngineError::from)
    }

    /// Sends a failure reply and tears the record down.
    fn responder_reply_failure(&mut self, id: OpId, result: ResultCode, why: i32) {
        let Some(mut rec) = self.responders.remove(&id) else {
            return;
        };
        debug!(?id, ?result, reason = why, "replying failure");
        let reply = self.build_reply(&mut rec, result, why, ReplyFlags::empty());
        let _ = self.send_reply(&rec, reply);
        self.finish_responder(rec);
    }

    /// Replies to a remove-class op and tears the record down.
    fn responder_terminal_result(
        &mut self,
        id: OpId,
        mut rec: ResponderOp,
        result: ResultCode,
        why: i32,
    ) {
        let _ = id;
        let reply = self.build_reply(&mut rec, result, why, ReplyFlags::empty());
        let _ = self.send_reply(&rec, reply);
        self.finish_responder(rec);
    }

    /// Protocol violation on the stream: abort towards the peer and
    /// tear down.
    fn responder_abort(&mut self, rec: ResponderOp) {
        let _ = self.transport.send(
            rec.session,
            FnCode::CacheData,
            vec![DataMsg::Abort.encode()],
            None,
            Priority::High,
        );
        self.finish_responder(rec);
    }

    /// Writer-side HTTP error: notify the initiator and close the VC
    /// with an error reason.
    fn responder_write_error(&mut self, mut rec: ResponderOp, why: i32) {
        let _ = self.transport.send(
            rec.session,
            FnCode::CacheData,
            vec![DataMsg::Error { code: why }.encode()],
            None,
            Priority::High,
        );
        if let Some(vc) = rec.cache_vc.take() {
            self.cache.vc_do_io_close(vc, Some(why));
        }
        self.finish_responder(rec);
    }

    /// Terminal teardown: the session closes before the record is
    /// freed, and a still-open cache VC is closed on the way out.
    fn finish_responder(&mut self, mut rec: ResponderOp) {
        if let Some(vc) = rec.cache_vc.take() {
            self.cache.vc_do_io_close(vc, None);
        }
        self.transport.close(rec.session);
        self.unbind(rec.session);
        metrics().responder_ops_active.dec();
    }
}

impl ResponderOp {
    fn init_short(&mut self, msg: &cachelink_wire::ShortOp) {
        self.digest = msg.digest;
        self.frag = msg.frag;
        self.seqno = msg.seqno;
        self.no_reply = msg.seqno.is_none();
        self.hostname = msg.hostname.clone();
    }

    fn init_long(&mut self, msg: &cachelink_wire::LongOp) {
        self.digest = msg.digest;
        self.frag = msg.frag;
        self.seqno = msg.seqno;
        self.no_reply = msg.seqno.is_none();
        self.pin_time = msg.pin_time;
        self.hostname = msg.hostname.clone();
    }
}
