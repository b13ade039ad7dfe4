//! Engine error types.

use thiserror::Error;

use crate::transport::TransportError;
use cachelink_wire::WireError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while driving cluster cache operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wire protocol error; fatal for the session it arrived on.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A peer violated the streaming protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A message arrived for a session with no bound handler.
    #[error("unbound session")]
    UnboundSession,

    /// An operation handle does not name a live record.
    #[error("unknown operation record")]
    UnknownRecord,
}
