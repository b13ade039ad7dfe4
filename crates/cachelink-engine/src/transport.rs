//! The session adapter: the seam between the engine and the cluster
//! transport.
//!
//! A session is a bidirectional ordered framed channel to a single peer.
//! The engine consumes the transport through the [`SessionTransport`]
//! trait; binding a handler to a session is engine-local (session id to
//! record table), so the transport only routes bytes and lifecycle events.

use std::time::Duration;

use bytes::Bytes;
use cachelink_types::PeerId;
use thiserror::Error;

/// Opaque handle to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Priority class for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Control messages and errors.
    High,
    /// Operation replies.
    Mid,
    /// Bulk object data.
    Low,
}

/// Handler class of a framed message, routing it to the right dispatch
/// path on the receiving engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnCode {
    /// A cache operation request; creates a responder record.
    CacheOp,
    /// An operation reply; routed to the bound initiator record.
    CacheOpResult,
    /// A data or stream-control frame; routed to the bound record.
    CacheData,
}

/// Notification mask selecting which low-level events a session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// Deliver nothing.
    pub const NONE: EventMask = EventMask(0);
    /// Deliver "peer message ready" notifications.
    pub const NOTIFY_DEALER: EventMask = EventMask(1 << 0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Events a session delivers to the engine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An inbound framed message.
    Message { fn_code: FnCode, payload: Bytes },
    /// The peer owning this session died.
    PeerDead,
    /// The session was torn down by the transport or the remote side.
    Closed,
}

/// Transport-level failures surfaced to the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session is closed or unknown.
    #[error("session closed")]
    SessionClosed,

    /// The peer is unreachable.
    #[error("peer {0} unreachable")]
    PeerUnreachable(PeerId),

    /// The transport refused the message.
    #[error("send rejected: {0}")]
    SendRejected(&'static str),
}

/// The cluster transport as consumed by the engine.
///
/// `close` is idempotent and races safely with a peer-initiated close.
/// `send` returning an error obliges the caller to close the session and
/// surface a failure to whoever is waiting on it.
pub trait SessionTransport {
    /// Opens a session to `peer`.
    fn create_session(&mut self, peer: PeerId) -> Result<SessionId, TransportError>;

    /// Returns the peer a session is connected to.
    fn peer_of(&self, session: SessionId) -> Option<PeerId>;

    /// Transmits a possibly multi-block payload.
    fn send(
        &mut self,
        session: SessionId,
        fn_code: FnCode,
        chain: Vec<Bytes>,
        deadline: Option<Duration>,
        priority: Priority,
    ) -> Result<(), TransportError>;

    /// Selects which events the session will deliver.
    fn set_events(&mut self, session: SessionId, mask: EventMask);

    /// Closes the session. Returns true if this call closed it.
    fn close(&mut self, session: SessionId) -> bool;

    /// Drains pending events for all sessions.
    fn poll_events(&mut self) -> Vec<(SessionId, SessionEvent)>;
}
