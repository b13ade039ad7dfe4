//! # cachelink-wire: Binary wire protocol for cluster cache operations
//!
//! This crate defines the fixed-layout messages that ship cache operations
//! between cluster nodes.
//!
//! ## Message Layout
//!
//! Every message opens with a 16-byte common header carrying the protocol
//! version, a byte-order marker, the opcode, per-request flags, and the
//! total message length. Integer fields travel in the sender's native byte
//! order; the receiver performs a field-wise swap only when the marker says
//! the orders differ. Digests and opaque blobs are raw bytes and never
//! swap.
//!
//! ## Shapes
//!
//! - **Short** — open-read, open-write, update, remove, deref
//! - **Short-2** — link (two digests)
//! - **Long** — open-read-long / open-write-long with marshaled HTTP state
//! - **Reply** — operation result, optionally with inlined object data
//! - **Data frames** — streaming reads and writes with explicit reenables

mod data;
mod error;
mod header;
mod msg;
mod reply;

pub use data::DataMsg;
pub use error::{WireError, WireResult};
pub use header::{
    MsgHeader, Opcode, WireCursor, BYTE_ORDER_MARK, BYTE_ORDER_MARK_SWAPPED, HEADER_SIZE,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use msg::{LongOp, Short2Op, ShortOp, LONG_FIXED, SHORT2_FIXED, SHORT_FIXED};
pub use reply::{OpReply, ReplyFlags, REPLY_FIXED};

use bytes::Bytes;


/// A fully decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Short(ShortOp),
    Short2(Short2Op),
    Long(LongOp),
    Reply(OpReply),
    Data(DataMsg),
}

/// Decodes a complete message: header validation, byte-order resolution,
/// shape selection by opcode, and trailer extraction.
pub fn decode_message(raw: Bytes) -> WireResult<(MsgHeader, Body)> {
    let (hdr, mut cur) = MsgHeader::decode(raw)?;
    let body = match hdr.opcode {
        Opcode::OpenRead
        | Opcode::OpenWrite
        | Opcode::Update
        | Opcode::Remove
        | Opcode::Deref => Body::Short(ShortOp::decode(&hdr, &mut cur)?),
        Opcode::Link => Body::Short2(Short2Op::decode(&hdr, &mut cur)?),
        Opcode::OpenReadLong | Opcode::OpenWriteLong => Body::Long(LongOp::decode(&hdr, &mut cur)?),
        Opcode::OpResult => Body::Reply(OpReply::decode(&hdr, &mut cur)?),
        _ => Body::Data(DataMsg::decode(&hdr, &mut cur)?),
    };
    Ok((hdr, body))
}
