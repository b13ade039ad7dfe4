//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire messages.
///
/// Every decode error is fatal for the session that produced the bytes:
/// the stream is framed by the transport, so a malformed message means the
/// peer disagrees about the protocol, not that more bytes are needed.
#[derive(Debug, Error)]
pub enum WireError {
    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    BadVersion(u16),

    /// The byte-order marker is neither native nor swapped.
    #[error("unrecognized byte-order marker: 0x{0:04x}")]
    BadByteOrder(u16),

    /// Unknown opcode.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u16),

    /// The message is shorter than its fixed part.
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// The header-declared length disagrees with the received bytes.
    #[error("length mismatch: header declares {declared}, received {received}")]
    LengthMismatch { declared: usize, received: usize },

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// A variable trailer overruns the declared message length.
    #[error("trailer overrun: fixed {fixed} + declared trailers {trailers} > length {length}")]
    TrailerOverrun {
        fixed: usize,
        trailers: usize,
        length: usize,
    },

    /// A field holds a value outside its domain.
    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },
}
