//! Initiator state machine: the requesting side of a remote cache
//! operation.
//!
//! `do_op` allocates an initiator VC bound to the caller and a fresh
//! session, ships the request, and registers the operation for timeout
//! and peer-death handling. Replies and data frames feed back through
//! the session binding; the caller drives the VC through the `vc_*`
//! methods exactly as it would a local cache VC.
//!
//! A timed-out or cancelled record lingers until its reply arrives or
//! its session dies, so a late reply is dropped instead of reaching a
//! dead caller.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use cachelink_types::{reason, CacheKey, HttpInfo, OpFlags, PeerId, ResultCode, SeqNo};
use cachelink_wire::{DataMsg, LongOp, OpReply, Opcode, ReplyFlags, Short2Op, ShortOp};

use crate::engine::{
    Binding, CallerEvent, ClusterCache, OpAction, OpArgs, OpCallback, RetryAction, VcId,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics::metrics;
use crate::seqreg::RegOutcome;
use crate::stream::StreamFlow;
use crate::transport::{EventMask, FnCode, Priority, SessionId};
use crate::vccache::{Insert, Lookup};

/// States of an initiator record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitiatorState {
    /// Reuse-cache probe deferred by lock contention; nothing sent yet.
    ReuseProbe,
    /// Request sent, awaiting the reply.
    AwaitingReply,
    /// Open-read succeeded; consuming inlined data, no stream started.
    ReadIdle,
    /// Read stream in progress.
    ReadStreaming,
    /// Open-write succeeded; no stream started.
    WriteIdle,
    /// Write stream in progress.
    WriteStreaming,
    /// Converted write VC parked in the reuse cache.
    Salvaged,
}

/// Initiator-side operation record.
pub(crate) struct InitiatorOp {
    pub peer: PeerId,
    pub session: Option<SessionId>,
    pub opcode: Opcode,
    pub key: CacheKey,
    pub seqno: SeqNo,
    pub state: InitiatorState,
    pub caller: Option<Box<dyn OpCallback>>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub registered: bool,
    pub pin_time: u32,
    /// Request arguments, held until the request is actually sent.
    pub args: Option<OpArgs>,
    pub doc_size: u64,
    pub open_flags: u32,
    pub http_info: Option<HttpInfo>,
    pub recv: VecDeque<Bytes>,
    pub flow: StreamFlow,
    pub remote_closed: bool,
    pub vio_nbytes: u64,
}

impl InitiatorOp {
    fn new(peer: PeerId, opcode: Opcode, args: OpArgs, seqno: SeqNo) -> Self {
        let pin_time = match &args {
            OpArgs::Write { pin_time, .. }
            | OpArgs::WriteHttp { pin_time, .. }
            | OpArgs::Update { pin_time, .. } => *pin_time,
            _ => 0,
        };
        Self {
            peer,
            session: None,
            opcode,
            key: args.key(),
            seqno,
            state: InitiatorState::AwaitingReply,
            caller: None,
            cancelled: false,
            timed_out: false,
            registered: false,
            pin_time,
            args: Some(args),
            doc_size: 0,
            open_flags: 0,
            http_info: None,
            recv: VecDeque::new(),
            flow: StreamFlow::new(),
            remote_closed: false,
            vio_nbytes: 0,
        }
    }

    /// Delivers an event to the caller unless it is no longer listening.
    fn notify(&mut self, event: CallerEvent) {
        if self.cancelled || self.timed_out {
            return;
        }
        if let Some(caller) = self.caller.as_mut() {
            caller.on_event(event);
        }
    }

    pub(crate) fn awaiting_reply(&self) -> bool {
        matches!(self.state, InitiatorState::AwaitingReply)
    }

    fn is_read(&self) -> bool {
        matches!(
            self.state,
            InitiatorState::ReadIdle | InitiatorState::ReadStreaming
        )
    }
}

/// The terminal failure event matching a request opcode.
fn failure_event(opcode: Opcode, vc: VcId, reason: i32) -> CallerEvent {
    match opcode {
        Opcode::OpenRead | Opcode::OpenReadLong => CallerEvent::OpenReadFailed { vc, reason },
        Opcode::OpenWrite | Opcode::OpenWriteLong => CallerEvent::OpenWriteFailed { vc, reason },
        Opcode::Update => CallerEvent::UpdateFailed { vc, reason },
        Opcode::Remove => CallerEvent::RemoveFailed { vc, reason },
        Opcode::Link => CallerEvent::LinkFailed { vc, reason },
        _ => CallerEvent::DerefFailed { vc, reason },
    }
}

impl ClusterCache {
    // ==================================================================
    // Caller entry points
    // ==================================================================

    /// Starts a remote cache operation against `peer`.
    ///
    /// Returns the caller's cancellation handle, or `None` when the
    /// request could not even be sent; the caller then falls back as if
    /// the operation had never started.
    pub fn do_op(
        &mut self,
        caller: Box<dyn OpCallback>,
        peer: PeerId,
        args: OpArgs,
        now: Instant,
    ) -> Option<OpAction> {
        let opcode = args.opcode();
        metrics().remote_ops.inc();

        // A long open-write may already be resolvable from the reuse
        // cache, avoiding the RPC entirely.
        let mut caller = caller;
        if opcode == Opcode::OpenWriteLong {
            match self.shared.reuse.lookup(&args.key().digest) {
                Lookup::Hit(sv) => match self.adopt_salvaged(sv, caller) {
                    Ok(vc) => {
                        debug!(?vc, "open-write resolved from reuse cache");
                        return Some(OpAction { vc });
                    }
                    Err(c) => caller = c,
                },
                Lookup::Retry => {
                    // Park the request and probe again after the
                    // retry period.
                    let id = VcId(self.alloc_id());
                    let seqno = self.shared.seqgen.next();
                    let mut rec = InitiatorOp::new(peer, opcode, args, seqno);
                    rec.state = InitiatorState::ReuseProbe;
                    rec.caller = Some(caller);
                    self.deadlines.arm(id, now + self.config.cluster_timeout);
                    self.retries
                        .push(now + self.config.retry_period, RetryAction::ReuseProbe { vc: id });
                    self.initiators.insert(id, rec);
                    return Some(OpAction { vc: id });
                }
                Lookup::Miss => {}
            }
        }

        let id = VcId(self.alloc_id());
        let seqno = self.shared.seqgen.next();
        let mut rec = InitiatorOp::new(peer, opcode, args, seqno);
        rec.caller = Some(caller);

        match self.launch_remote(id, rec, now) {
            Ok(()) => Some(OpAction { vc: id }),
            Err(_rec) => None,
        }
    }

    /// Cancels an operation: no further caller callbacks; resources are
    /// reclaimed when the record reaches its terminal state.
    pub fn cancel(&mut self, action: OpAction) -> EngineResult<()> {
        let rec = self
            .initiators
            .get_mut(&action.vc)
            .ok_or(EngineError::UnknownRecord)?;
        rec.cancelled = true;
        rec.caller = None;
        Ok(())
    }

    /// Declares how many bytes the caller intends to read and delivers
    /// the first read disposition.
    pub fn vc_do_io_read(&mut self, vc: VcId, nbytes: u64) -> EngineResult<()> {
        let mut rec = self.take_read_record(vc)?;
        rec.vio_nbytes = nbytes;
        self.read_disposition(vc, &mut rec);
        self.initiators.insert(vc, rec);
        Ok(())
    }

    /// Drains the bytes the VC has received so far.
    pub fn vc_take_read(&mut self, vc: VcId) -> EngineResult<Bytes> {
        let rec = self
            .initiators
            .get_mut(&vc)
            .ok_or(EngineError::UnknownRecord)?;
        if rec.recv.len() == 1 {
            return Ok(rec.recv.pop_front().unwrap_or_default());
        }
        let total: usize = rec.recv.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        while let Some(b) = rec.recv.pop_front() {
            out.extend_from_slice(&b);
        }
        Ok(out.freeze())
    }

    /// Signals that the caller consumed delivered data and is ready for
    /// more.
    pub fn vc_reenable(&mut self, vc: VcId) -> EngineResult<()> {
        let mut rec = self.take_read_record(vc)?;
        self.read_disposition(vc, &mut rec);
        self.initiators.insert(vc, rec);
        Ok(())
    }

    /// Starts the write stream: announces `nbytes` of payload and the
    /// optional marshaled HTTP info.
    pub fn vc_do_io_write(
        &mut self,
        vc: VcId,
        nbytes: u64,
        http_info: Option<&HttpInfo>,
    ) -> EngineResult<()> {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return Err(EngineError::UnknownRecord);
        };
        if rec.state != InitiatorState::WriteIdle {
            self.initiators.insert(vc, rec);
            return Err(EngineError::Protocol("write begin on non-write VC"));
        }
        let Some(sid) = rec.session else {
            self.initiators.insert(vc, rec);
            return Err(EngineError::Protocol("write VC has no session"));
        };

        let info_bytes = match http_info {
            Some(info) => {
                let mut buf = BytesMut::with_capacity(info.marshal_len());
                info.marshal(&mut buf);
                buf.freeze()
            }
            None => Bytes::new(),
        };
        let frame = DataMsg::WriteBegin {
            nbytes,
            http_info: info_bytes,
        };
        rec.flow.begin(nbytes);
        rec.vio_nbytes = nbytes;
        rec.state = InitiatorState::WriteStreaming;

        let sent = self.transport.send(
            sid,
            FnCode::CacheData,
            vec![frame.encode()],
            None,
            Priority::Mid,
        );
        // Stay subscribed so error frames from the responder reach us.
        self.transport.set_events(sid, EventMask::NOTIFY_DEALER);
        match sent {
            Ok(()) => {
                self.initiators.insert(vc, rec);
                Ok(())
            }
            Err(e) => {
                warn!(?vc, error = %e, "write begin send failed");
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::CLUSTER_NOT_READY,
                });
                self.free_initiator_record(vc, rec, Instant::now());
                Err(EngineError::Protocol("write begin send failed"))
            }
        }
    }

    /// Ships one chunk of write payload.
    pub fn vc_write(&mut self, vc: VcId, data: Bytes) -> EngineResult<()> {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return Err(EngineError::UnknownRecord);
        };
        if rec.state != InitiatorState::WriteStreaming {
            self.initiators.insert(vc, rec);
            return Err(EngineError::Protocol("write on non-streaming VC"));
        }
        let Some(sid) = rec.session else {
            self.initiators.insert(vc, rec);
            return Err(EngineError::Protocol("write VC has no session"));
        };

        let n = data.len() as u64;
        let frame = DataMsg::WriteDone { payload: data };
        match self
            .transport
            .send(sid, FnCode::CacheData, vec![frame.encode()], None, Priority::Low)
        {
            Ok(()) => {
                rec.flow.account(n);
                metrics().data_bytes_sent.inc_by(n as f64);
                self.initiators.insert(vc, rec);
                Ok(())
            }
            Err(e) => {
                warn!(?vc, error = %e, "write data send failed");
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::CLUSTER_NOT_READY,
                });
                self.free_initiator_record(vc, rec, Instant::now());
                Err(EngineError::Protocol("write data send failed"))
            }
        }
    }

    /// Replaces the object's HTTP info without writing data. Only legal
    /// before any payload has been shipped.
    pub fn vc_header_update(&mut self, vc: VcId, info: &HttpInfo) -> EngineResult<()> {
        let rec = self
            .initiators
            .get_mut(&vc)
            .ok_or(EngineError::UnknownRecord)?;
        if rec.state != InitiatorState::WriteIdle || rec.flow.done != 0 {
            return Err(EngineError::Protocol("header update after data"));
        }
        let Some(sid) = rec.session else {
            return Err(EngineError::Protocol("write VC has no session"));
        };
        let mut buf = BytesMut::with_capacity(info.marshal_len());
        info.marshal(&mut buf);
        let frame = DataMsg::HeaderOnlyUpdate {
            http_info: buf.freeze(),
        };
        self.transport
            .send(sid, FnCode::CacheData, vec![frame.encode()], None, Priority::Mid)
            .map_err(EngineError::from)
    }

    /// Closes the VC. A clean close of a write stream finalises the
    /// byte count; a close with a reason aborts the stream.
    pub fn vc_do_io_close(&mut self, vc: VcId, close_reason: Option<i32>) -> EngineResult<()> {
        let Some(rec) = self.initiators.remove(&vc) else {
            return Err(EngineError::UnknownRecord);
        };
        if let Some(sid) = rec.session {
            let frame = match (rec.state, close_reason) {
                (InitiatorState::WriteStreaming, None) => {
                    Some((DataMsg::Close { nbytes: rec.flow.done }, Priority::Mid))
                }
                (InitiatorState::WriteStreaming | InitiatorState::WriteIdle, Some(_))
                | (InitiatorState::ReadStreaming, Some(_)) => {
                    Some((DataMsg::Abort, Priority::High))
                }
                _ => None,
            };
            if let Some((frame, priority)) = frame {
                let _ = self.transport.send(
                    sid,
                    FnCode::CacheData,
                    vec![frame.encode()],
                    None,
                    priority,
                );
            }
        }
        self.free_initiator_record(vc, rec, Instant::now());
        Ok(())
    }

    // ==================================================================
    // Launch and registration
    // ==================================================================

    /// Opens the session, sends the request, and registers the record.
    /// Gives the record back on failure so the caller decides whether a
    /// callback is owed.
    fn launch_remote(
        &mut self,
        id: VcId,
        mut rec: InitiatorOp,
        now: Instant,
    ) -> Result<(), InitiatorOp> {
        let session = match self.transport.create_session(rec.peer) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %rec.peer, error = %e, "session open failed");
                return Err(rec);
            }
        };

        let args = rec.args.take().expect("unsent request retains its args");
        let msg = build_request(&args, rec.seqno, self.config.reply_buffer_hint);
        debug!(
            ?id,
            opcode = ?rec.opcode,
            seqno = %rec.seqno,
            peer = %rec.peer,
            "sending cache op"
        );

        if let Err(e) = self.transport.send(
            session,
            FnCode::CacheOp,
            vec![msg],
            Some(self.config.cluster_timeout),
            Priority::High,
        ) {
            warn!(peer = %rec.peer, error = %e, "cache op send failed");
            self.transport.close(session);
            return Err(rec);
        }

        rec.session = Some(session);
        rec.state = InitiatorState::AwaitingReply;
        self.bindings.insert(session, Binding::Initiator(id));
        // Await replies (and only replies) until the stream starts.
        self.transport.set_events(session, EventMask::NOTIFY_DEALER);

        match self.shared.registry.insert(rec.peer, rec.seqno, id.0) {
            RegOutcome::Done => rec.registered = true,
            RegOutcome::Retry => self.retries.push(
                now + self.config.retry_period,
                RetryAction::RegistryInsert {
                    peer: rec.peer,
                    seqno: rec.seqno,
                    op: id.0,
                },
            ),
        }

        self.deadlines.arm(id, now + self.config.cluster_timeout);
        self.initiators.insert(id, rec);
        Ok(())
    }

    /// Re-probes the reuse cache for a parked long open-write.
    pub(crate) fn retry_reuse_probe(&mut self, vc: VcId, now: Instant) {
        let lookup = {
            let Some(rec) = self.initiators.get(&vc) else {
                return;
            };
            if rec.state != InitiatorState::ReuseProbe {
                return;
            }
            self.shared.reuse.lookup(&rec.key.digest)
        };

        match lookup {
            Lookup::Retry => {
                self.retries
                    .push(now + self.config.retry_period, RetryAction::ReuseProbe { vc });
            }
            Lookup::Hit(sv) => {
                let Some(mut rec) = self.initiators.remove(&vc) else {
                    return;
                };
                self.deadlines.cancel(&vc);
                if rec.cancelled {
                    return;
                }
                let Some(caller) = rec.caller.take() else {
                    return;
                };
                match self.adopt_salvaged(sv, caller) {
                    Ok(_) => {}
                    Err(caller) => {
                        // The cached entry was stale; go remote after all.
                        rec.caller = Some(caller);
                        if let Err(mut rec) = self.launch_remote(vc, rec, now) {
                            rec.notify(failure_event(
                                rec.opcode,
                                vc,
                                reason::CLUSTER_NOT_READY,
                            ));
                        }
                    }
                }
            }
            Lookup::Miss => {
                let Some(rec) = self.initiators.remove(&vc) else {
                    return;
                };
                self.deadlines.cancel(&vc);
                if rec.cancelled {
                    return;
                }
                if let Err(mut rec) = self.launch_remote(vc, rec, now) {
                    rec.notify(failure_event(rec.opcode, vc, reason::CLUSTER_NOT_READY));
                }
            }
        }
    }

    /// Attaches a caller to a parked salvaged write VC.
    fn adopt_salvaged(
        &mut self,
        sv: VcId,
        caller: Box<dyn OpCallback>,
    ) -> Result<VcId, Box<dyn OpCallback>> {
        match self.initiators.get_mut(&sv) {
            Some(rec) if rec.state == InitiatorState::Salvaged => {
                rec.caller = Some(caller);
                rec.state = InitiatorState::WriteIdle;
                rec.flow = StreamFlow::new();
                rec.cancelled = false;
                rec.timed_out = false;
                rec.notify(CallerEvent::OpenWrite { vc: sv });
                Ok(sv)
            }
            // The record died while its id sat in the cache; treat as a
            // miss.
            _ => Err(caller),
        }
    }

    /// Retries publishing a freshly salvaged VC into the reuse cache.
    pub(crate) fn retry_reuse_insert(&mut self, vc: VcId, now: Instant) {
        let digest = match self.initiators.get(&vc) {
            Some(rec) if rec.state == InitiatorState::Salvaged => rec.key.digest,
            _ => return,
        };
        match self.shared.reuse.insert(digest, vc) {
            Insert::Ok(displaced) => {
                if let Some(old) = displaced {
                    self.close_salvaged(old);
                }
            }
            Insert::Retry => {
                self.retries
                    .push(now + self.config.retry_period, RetryAction::ReuseInsert { vc });
            }
        }
    }

    /// Closes a salvaged VC purged from the reuse cache.
    pub(crate) fn close_salvaged(&mut self, vc: VcId) {
        let Some(rec) = self.initiators.remove(&vc) else {
            return;
        };
        if rec.state != InitiatorState::Salvaged {
            // Adopted between purge and close; leave it alone.
            self.initiators.insert(vc, rec);
            return;
        }
        trace!(?vc, "closing purged salvaged VC");
        self.free_initiator_record(vc, rec, Instant::now());
    }

    // ==================================================================
    // Inbound events
    // ==================================================================

    /// Handles the operation reply.
    pub(crate) fn initiator_reply(&mut self, vc: VcId, reply: OpReply, now: Instant) {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return;
        };
        self.deadlines.cancel(&vc);
        if rec.registered {
            if let RegOutcome::Retry = self.shared.registry.remove(rec.peer, rec.seqno) {
                self.retries.push(
                    now + self.config.retry_period,
                    RetryAction::RegistryRemove {
                        peer: rec.peer,
                        seqno: rec.seqno,
                    },
                );
            }
            rec.registered = false;
        }

        if reply.seqno != rec.seqno {
            warn!(?vc, got = %reply.seqno, want = %rec.seqno, "reply seqno mismatch");
            rec.notify(failure_event(rec.opcode, vc, reason::CLUSTER_PROTOCOL));
            self.free_initiator_record(vc, rec, now);
            return;
        }

        if rec.timed_out || rec.cancelled {
            trace!(?vc, "dropping late reply");
            metrics().late_replies.inc();
            if reply.result.is_open() {
                if let Some(sid) = rec.session {
                    let _ = self.transport.send(
                        sid,
                        FnCode::CacheData,
                        vec![DataMsg::Abort.encode()],
                        None,
                        Priority::High,
                    );
                }
            }
            self.free_initiator_record(vc, rec, now);
            return;
        }

        debug!(?vc, result = ?reply.result, "reply");
        match reply.result {
            ResultCode::OpenRead => {
                let http_info = if reply.http_info.is_empty() {
                    None
                } else {
                    match HttpInfo::unmarshal(reply.http_info.clone()) {
                        Ok(info) => Some(info),
                        Err(e) => {
                            warn!(?vc, error = %e, "reply http info unmarshal failed");
                            rec.notify(failure_event(rec.opcode, vc, reason::CLUSTER_PROTOCOL));
                            self.free_initiator_record(vc, rec, now);
                            return;
                        }
                    }
                };
                rec.doc_size = reply.doc_size;
                rec.open_flags = reply.reason as u32;
                rec.flow.begin(reply.doc_size);
                if !reply.data.is_empty() {
                    let n = reply.data.len() as u64;
                    rec.flow.account(n);
                    metrics().data_bytes_received.inc_by(n as f64);
                    rec.recv.push_back(reply.data);
                }
                rec.remote_closed = rec.flow.complete();
                rec.http_info = http_info.clone();
                rec.state = InitiatorState::ReadIdle;
                rec.notify(CallerEvent::OpenRead {
                    vc,
                    doc_size: reply.doc_size,
                    http_info,
                });
                self.initiators.insert(vc, rec);
            }
            ResultCode::OpenWrite => {
                rec.open_flags = reply.reason as u32;
                rec.state = InitiatorState::WriteIdle;
                rec.notify(CallerEvent::OpenWrite { vc });
                self.initiators.insert(vc, rec);
            }
            ResultCode::OpenReadFailed
                if reply.flags.contains(ReplyFlags::WRITE_TOKEN) && rec.opcode.is_read() =>
            {
                // The responder salvaged the failed read into an open
                // write; convert the VC and publish it for the next
                // writer on this node.
                debug!(?vc, "read failed, salvaging write VC");
                rec.notify(CallerEvent::OpenReadFailed {
                    vc,
                    reason: reply.reason,
                });
                rec.caller = None;
                rec.opcode = Opcode::OpenWriteLong;
                rec.state = InitiatorState::Salvaged;
                rec.flow = StreamFlow::new();
                let digest = rec.key.digest;
                self.initiators.insert(vc, rec);
                match self.shared.reuse.insert(digest, vc) {
                    Insert::Ok(displaced) => {
                        if let Some(old) = displaced {
                            self.close_salvaged(old);
                        }
                    }
                    Insert::Retry => {
                        self.retries
                            .push(now + self.config.retry_period, RetryAction::ReuseInsert { vc });
                    }
                }
            }
            ResultCode::Remove => {
                rec.notify(CallerEvent::RemoveDone { vc });
                self.free_initiator_record(vc, rec, now);
            }
            ResultCode::Link => {
                rec.notify(CallerEvent::LinkDone { vc });
                self.free_initiator_record(vc, rec, now);
            }
            ResultCode::Deref => {
                rec.notify(CallerEvent::DerefDone { vc });
                self.free_initiator_record(vc, rec, now);
            }
            failed => {
                let event = match failed {
                    ResultCode::OpenReadFailed | ResultCode::LookupFailed => {
                        CallerEvent::OpenReadFailed {
                            vc,
                            reason: reply.reason,
                        }
                    }
                    ResultCode::OpenWriteFailed => CallerEvent::OpenWriteFailed {
                        vc,
                        reason: reply.reason,
                    },
                    ResultCode::UpdateFailed => CallerEvent::UpdateFailed {
                        vc,
                        reason: reply.reason,
                    },
                    ResultCode::RemoveFailed => CallerEvent::RemoveFailed {
                        vc,
                        reason: reply.reason,
                    },
                    ResultCode::LinkFailed => CallerEvent::LinkFailed {
                        vc,
                        reason: reply.reason,
                    },
                    _ => CallerEvent::DerefFailed {
                        vc,
                        reason: reply.reason,
                    },
                };
                rec.notify(event);
                self.free_initiator_record(vc, rec, now);
            }
        }
    }

    /// Handles a data frame on an initiator session.
    pub(crate) fn initiator_frame(&mut self, vc: VcId, frame: DataMsg, now: Instant) {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return;
        };
        match frame {
            DataMsg::ReadDone { payload } if rec.state == InitiatorState::ReadStreaming => {
                if !rec.flow.consume() {
                    warn!(?vc, "unexpected read data frame");
                    rec.notify(CallerEvent::VcError {
                        vc,
                        reason: reason::CLUSTER_PROTOCOL,
                    });
                    self.free_initiator_record(vc, rec, now);
                    return;
                }
                let n = payload.len() as u64;
                metrics().data_bytes_received.inc_by(n as f64);
                rec.flow.account(n);
                rec.recv.push_back(payload);
                if rec.flow.complete() {
                    rec.remote_closed = true;
                }
                rec.notify(CallerEvent::ReadReady { vc });
                self.initiators.insert(vc, rec);
            }
            DataMsg::Error { code } => {
                rec.notify(CallerEvent::VcError { vc, reason: code });
                self.free_initiator_record(vc, rec, now);
            }
            DataMsg::Abort => {
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::HTTP_ERROR,
                });
                self.free_initiator_record(vc, rec, now);
            }
            other => {
                warn!(?vc, frame = ?other.opcode(), state = ?rec.state, "unexpected frame");
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::CLUSTER_PROTOCOL,
                });
                self.free_initiator_record(vc, rec, now);
            }
        }
    }

    /// Fires the per-operation deadline.
    pub(crate) fn initiator_timeout(&mut self, vc: VcId, now: Instant) {
        let state = match self.initiators.get(&vc) {
            Some(rec) => rec.state,
            None => return,
        };
        match state {
            InitiatorState::ReuseProbe => {
                // Nothing was ever sent; fail and free outright.
                metrics().remote_op_timeouts.inc();
                let Some(mut rec) = self.initiators.remove(&vc) else {
                    return;
                };
                rec.notify(failure_event(rec.opcode, vc, reason::CLUSTER_OP_TIMEOUT));
                self.free_initiator_record(vc, rec, now);
            }
            InitiatorState::AwaitingReply => {
                let rec = self.initiators.get_mut(&vc).expect("checked above");
                if rec.timed_out {
                    // Second firing: the reply never came; reclaim.
                    let Some(rec) = self.initiators.remove(&vc) else {
                        return;
                    };
                    self.free_initiator_record(vc, rec, now);
                    return;
                }
                debug!(?vc, seqno = %rec.seqno, "cluster op timeout");
                metrics().remote_op_timeouts.inc();
                let event = failure_event(rec.opcode, vc, reason::CLUSTER_OP_TIMEOUT);
                rec.notify(event);
                // The record lingers for the late reply; no more caller
                // callbacks until then.
                rec.timed_out = true;
                rec.caller = None;
                self.deadlines.arm(vc, now + self.config.cluster_timeout);
            }
            _ => {}
        }
    }

    /// Handles the session dying under an initiator record.
    pub(crate) fn initiator_session_failed(&mut self, vc: VcId, now: Instant) {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return;
        };

        // A completed read stream ends with the responder closing the
        // session; that close is not a failure.
        if rec.remote_closed && rec.is_read() {
            if let Some(sid) = rec.session.take() {
                self.transport.close(sid);
                self.unbind(sid);
            }
            self.initiators.insert(vc, rec);
            return;
        }

        metrics().peer_failures.inc();
        match rec.state {
            InitiatorState::AwaitingReply => {
                let event = failure_event(rec.opcode, vc, reason::CLUSTER_NO_MACHINE);
                rec.notify(event);
            }
            InitiatorState::ReadIdle
            | InitiatorState::ReadStreaming
            | InitiatorState::WriteIdle
            | InitiatorState::WriteStreaming => {
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::CLUSTER_NO_MACHINE,
                });
            }
            InitiatorState::Salvaged | InitiatorState::ReuseProbe => {}
        }
        self.free_initiator_record(vc, rec, now);
    }

    /// Fails a record discovered through the registry's peer-death
    /// fan-out. The registry entry itself is already gone.
    pub(crate) fn initiator_peer_gone(&mut self, vc: VcId, now: Instant) {
        let Some(mut rec) = self.initiators.remove(&vc) else {
            return;
        };
        rec.registered = false;
        metrics().peer_failures.inc();
        let event = failure_event(rec.opcode, vc, reason::CLUSTER_NO_MACHINE);
        rec.notify(event);
        self.free_initiator_record(vc, rec, now);
    }

    // ==================================================================
    // Internals
    // ==================================================================

    fn take_read_record(&mut self, vc: VcId) -> EngineResult<InitiatorOp> {
        let Some(rec) = self.initiators.remove(&vc) else {
            return Err(EngineError::UnknownRecord);
        };
        if !rec.is_read() {
            let state = rec.state;
            self.initiators.insert(vc, rec);
            trace!(?vc, ?state, "read API on non-read VC");
            return Err(EngineError::Protocol("read API on non-read VC"));
        }
        Ok(rec)
    }

    /// Decides what a read caller gets next: buffered data, EOS, or a
    /// request for more from the responder.
    fn read_disposition(&mut self, vc: VcId, rec: &mut InitiatorOp) {
        if !rec.recv.is_empty() {
            rec.notify(CallerEvent::ReadReady { vc });
            return;
        }
        if rec.remote_closed || rec.flow.complete() {
            rec.notify(CallerEvent::ReadEos { vc });
            return;
        }
        let Some(sid) = rec.session else {
            rec.notify(CallerEvent::VcError {
                vc,
                reason: reason::CLUSTER_NO_MACHINE,
            });
            return;
        };

        let frame = if rec.state == InitiatorState::ReadIdle {
            rec.state = InitiatorState::ReadStreaming;
            let want = if rec.vio_nbytes > 0 {
                rec.vio_nbytes.min(rec.doc_size)
            } else {
                rec.doc_size
            };
            DataMsg::ReadBegin {
                offset: rec.flow.done,
                nbytes: want.saturating_sub(rec.flow.done),
            }
        } else {
            DataMsg::ReadReenable
        };

        match self
            .transport
            .send(sid, FnCode::CacheData, vec![frame.encode()], None, Priority::Mid)
        {
            Ok(()) => {
                rec.flow.arm();
                self.transport.set_events(sid, EventMask::NOTIFY_DEALER);
            }
            Err(e) => {
                warn!(?vc, error = %e, "read control send failed");
                rec.notify(CallerEvent::VcError {
                    vc,
                    reason: reason::CLUSTER_NOT_READY,
                });
            }
        }
    }

    /// Releases a record's session and registry footprint.
    fn free_initiator_record(&mut self, vc: VcId, rec: InitiatorOp, now: Instant) {
        self.deadlines.cancel(&vc);
        if let Some(sid) = rec.session {
            self.transport.close(sid);
            self.unbind(sid);
        }
        if rec.registered {
            if let RegOutcome::Retry = self.shared.registry.remove(rec.peer, rec.seqno) {
                self.retries.push(
                    now + self.config.retry_period,
                    RetryAction::RegistryRemove {
                        peer: rec.peer,
                        seqno: rec.seqno,
                    },
                );
            }
        }
    }
}

/// Builds the wire request for an operation.
fn build_request(args: &OpArgs, seqno: SeqNo, buffer_hint: u32) -> Bytes {
    match args {
        OpArgs::Read { key, hostname } => ShortOp {
            digest: key.digest,
            frag: key.frag_type,
            seqno,
            nbytes: 0,
            data: 0,
            buffer_hint,
            hostname: hostname.clone(),
        }
        .encode(Opcode::OpenRead, OpFlags::empty()),

        OpArgs::ReadHttp {
            key,
            http_request,
            lookup_config,
            hostname,
            conditional,
            purge,
        } => {
            let mut flags = OpFlags::empty();
            if *conditional {
                flags = flags | OpFlags::CONDITIONAL;
            }
            if *purge {
                flags = flags | OpFlags::PURGE;
            }
            LongOp {
                digest: key.digest,
                frag: key.frag_type,
                seqno,
                nbytes: 0,
                pin_time: 0,
                buffer_hint,
                http_blob: http_request.clone(),
                lookup_blob: lookup_config.clone(),
                hostname: hostname.clone(),
            }
            .encode(Opcode::OpenReadLong, flags)
        }

        OpArgs::Write {
            key,
            nbytes,
            pin_time,
            overwrite,
            hostname,
        } => {
            let flags = if *overwrite {
                OpFlags::OVERWRITE
            } else {
                OpFlags::empty()
            };
            ShortOp {
                digest: key.digest,
                frag: key.frag_type,
                seqno,
                nbytes: *nbytes,
                data: *pin_time,
                buffer_hint: 0,
                hostname: hostname.clone(),
            }
            .encode(Opcode::OpenWrite, flags)
        }

        OpArgs::WriteHttp {
            key,
            old_info,
            pin_time,
            hostname,
        } => {
            let (flags, http_blob) = match old_info {
                Some(info) => {
                    let mut buf = BytesMut::with_capacity(info.marshal_len());
                    info.marshal(&mut buf);
                    (OpFlags::HAVE_OLDINFO, buf.freeze())
                }
                None => (OpFlags::empty(), Bytes::new()),
            };
            LongOp {
                digest: key.digest,
                frag: key.frag_type,
                seqno,
                nbytes: 0,
                pin_time: *pin_time,
                buffer_hint: 0,
                http_blob,
                lookup_blob: Bytes::new(),
                hostname: hostname.clone(),
            }
            .encode(Opcode::OpenWriteLong, flags)
        }

        OpArgs::Update {
            key,
            pin_time,
            hostname,
        } => ShortOp {
            digest: key.digest,
            frag: key.frag_type,
            seqno,
            nbytes: 0,
            data: *pin_time,
            buffer_hint: 0,
            hostname: hostname.clone(),
        }
        .encode(Opcode::Update, OpFlags::OVERWRITE),

        OpArgs::Remove {
            key,
            opts,
            hostname,
        } => {
            let mut flags = OpFlags::empty();
            if opts.user_agents {
                flags = flags | OpFlags::REMOVE_USER_AGENTS;
            }
            if opts.link {
                flags = flags | OpFlags::REMOVE_LINK;
            }
            ShortOp {
                digest: key.digest,
                frag: key.frag_type,
                seqno,
                nbytes: 0,
                data: 0,
                buffer_hint: 0,
                hostname: hostname.clone(),
            }
            .encode(Opcode::Remove, flags)
        }

        OpArgs::Link { from, to, hostname } => Short2Op {
            from: from.digest,
            to: to.digest,
            frag: from.frag_type,
            seqno,
            hostname: hostname.clone(),
        }
        .encode(Opcode::Link, OpFlags::empty()),

        OpArgs::Deref { key, hostname } => ShortOp {
            digest: key.digest,
            frag: key.frag_type,
            seqno,
            nbytes: 0,
            data: 0,
            buffer_hint: 0,
            hostname: hostname.clone(),
        }
        .encode(Opcode::Deref, OpFlags::empty()),
    }
}
