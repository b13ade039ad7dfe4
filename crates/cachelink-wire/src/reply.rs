//! The cache-operation reply message.

use bytes::{BufMut, Bytes, BytesMut};
use cachelink_types::{OpFlags, ResultCode, SeqNo};

use crate::error::{WireError, WireResult};
use crate::header::{MsgHeader, Opcode, WireCursor, HEADER_SIZE};

/// Fixed part of a reply: seqno + result + reply flags + reason +
/// doc size + http length + data length.
pub const REPLY_FIXED: usize = 4 + 2 + 2 + 4 + 8 + 4 + 4;

/// Reply-specific flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyFlags(u16);

impl ReplyFlags {
    /// The responder salvaged a failed open-read into an established
    /// open-write; the initiator may convert its VC and publish it.
    pub const WRITE_TOKEN: ReplyFlags = ReplyFlags(1 << 0);

    pub const fn empty() -> Self {
        ReplyFlags(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        ReplyFlags(bits)
    }

    pub fn contains(self, other: ReplyFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Reply to a cache operation.
///
/// A successful open-read reply may inline the whole object (`data`) when
/// it fits under the small-fragment threshold; otherwise `data` is empty
/// and the object streams as `READ_DONE` frames. `doc_size` is the total
/// object size independent of how much was inlined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReply {
    pub seqno: SeqNo,
    pub result: ResultCode,
    pub flags: ReplyFlags,
    /// Negative reason code on failure; cache open flags on success.
    pub reason: i32,
    /// Total object size for open-read replies.
    pub doc_size: u64,
    /// Marshaled HTTP info, empty when not applicable.
    pub http_info: Bytes,
    /// Inlined object data, empty unless the small-object path was taken.
    pub data: Bytes,
}

impl OpReply {
    /// Creates a failure reply.
    pub fn failure(seqno: SeqNo, result: ResultCode, reason: i32) -> Self {
        debug_assert!(result.is_failure());
        Self {
            seqno,
            result,
            flags: ReplyFlags::empty(),
            reason,
            doc_size: 0,
            http_info: Bytes::new(),
            data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let total = HEADER_SIZE + REPLY_FIXED + self.http_info.len() + self.data.len();
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::encode(Opcode::OpResult, OpFlags::empty(), total, &mut buf);
        buf.put_u32_ne(self.seqno.as_u32());
        buf.put_u16_ne(self.result.to_wire());
        buf.put_u16_ne(self.flags.bits());
        buf.put_u32_ne(self.reason as u32);
        buf.put_u64_ne(self.doc_size);
        buf.put_u32_ne(self.http_info.len() as u32);
        buf.put_u32_ne(self.data.len() as u32);
        buf.put_slice(&self.http_info);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(hdr: &MsgHeader, cur: &mut WireCursor) -> WireResult<Self> {
        let length = hdr.length as usize;
        if HEADER_SIZE + REPLY_FIXED > length {
            return Err(WireError::TrailerOverrun {
                fixed: REPLY_FIXED,
                trailers: 0,
                length,
            });
        }
        let seqno = SeqNo::from_wire(cur.get_u32()?);
        let result_raw = cur.get_u16()?;
        let result = ResultCode::from_wire(result_raw).ok_or(WireError::InvalidField {
            field: "result",
            value: u64::from(result_raw),
        })?;
        let flags = ReplyFlags::from_bits(cur.get_u16()?);
        let reason = cur.get_i32()?;
        let doc_size = cur.get_u64()?;
        let h_len = cur.get_u32()? as usize;
        let d_len = cur.get_u32()? as usize;
        if HEADER_SIZE + REPLY_FIXED + h_len + d_len > length {
            return Err(WireError::TrailerOverrun {
                fixed: REPLY_FIXED,
                trailers: h_len + d_len,
                length,
            });
        }
        let http_info = cur.get_bytes(h_len)?;
        let data = cur.get_bytes(d_len)?;
        Ok(Self {
            seqno,
            result,
            flags,
            reason,
            doc_size,
            http_info,
            data,
        })
    }
}
