//! Cache operation request shapes: short, short-2, and long.
//!
//! The opcode in the common header selects the shape; the shape decoders
//! locate variable trailers as `length - fixed_len` and treat a negative
//! or oversize result as a fatal parse error.

use bytes::{BufMut, Bytes, BytesMut};
use cachelink_types::{Digest, FragType, OpFlags, SeqNo};

use crate::error::{WireError, WireResult};
use crate::header::{put_digest, MsgHeader, Opcode, WireCursor, HEADER_SIZE};

/// Fixed part of a short request: digest + frag type (+ pad) + seqno +
/// nbytes + data word + buffer-size hint.
pub const SHORT_FIXED: usize = Digest::SIZE + 4 + 4 + 8 + 4 + 4;

/// Fixed part of a short-2 request: two digests + frag type (+ pad) +
/// seqno.
pub const SHORT2_FIXED: usize = Digest::SIZE * 2 + 4 + 4;

/// Fixed part of a long request: digest + frag type (+ pad) + seqno +
/// nbytes + pin time + buffer-size hint + http length + config length.
pub const LONG_FIXED: usize = Digest::SIZE + 4 + 4 + 8 + 4 + 4 + 4 + 4;

/// Reads a fragment type encoded as a u16 plus a u16 pad.
fn get_frag(cur: &mut WireCursor) -> WireResult<FragType> {
    let raw = cur.get_u16()?;
    let _pad = cur.get_u16()?;
    FragType::from_wire(raw).ok_or(WireError::InvalidField {
        field: "frag_type",
        value: u64::from(raw),
    })
}

/// Writes a fragment type as a u16 plus a u16 pad.
fn put_frag(buf: &mut BytesMut, frag: FragType) {
    buf.put_u16_ne(frag.to_wire());
    buf.put_u16_ne(0);
}

/// Short-form request, used by open-read, open-write, update, remove and
/// deref.
///
/// The per-opcode `data` word carries the pin time for open-write and is
/// zero otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortOp {
    pub digest: Digest,
    pub frag: FragType,
    pub seqno: SeqNo,
    /// Declared object size for open-write; zero otherwise.
    pub nbytes: u64,
    /// Per-opcode data word (pin time for open-write).
    pub data: u32,
    /// Upper bound on data inlined in the reply.
    pub buffer_hint: u32,
    /// Trailing hostname, possibly empty.
    pub hostname: Bytes,
}

impl ShortOp {
    /// Encodes this request under the given opcode and flags.
    pub fn encode(&self, opcode: Opcode, flags: OpFlags) -> Bytes {
        let total = HEADER_SIZE + SHORT_FIXED + self.hostname.len();
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::encode(opcode, flags, total, &mut buf);
        put_digest(&mut buf, &self.digest);
        put_frag(&mut buf, self.frag);
        buf.put_u32_ne(self.seqno.as_u32());
        buf.put_u64_ne(self.nbytes);
        buf.put_u32_ne(self.data);
        buf.put_u32_ne(self.buffer_hint);
        buf.put_slice(&self.hostname);
        buf.freeze()
    }

    /// Decodes the shape from a cursor positioned after the header.
    pub fn decode(hdr: &MsgHeader, cur: &mut WireCursor) -> WireResult<Self> {
        check_trailer(hdr, SHORT_FIXED, 0)?;
        let digest = cur.get_digest()?;
        let frag = get_frag(cur)?;
        let seqno = SeqNo::from_wire(cur.get_u32()?);
        let nbytes = cur.get_u64()?;
        let data = cur.get_u32()?;
        let buffer_hint = cur.get_u32()?;
        let hostname = cur.take_rest();
        Ok(Self {
            digest,
            frag,
            seqno,
            nbytes,
            data,
            buffer_hint,
            hostname,
        })
    }
}

/// Short-2 request: two digests, used by link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Short2Op {
    pub from: Digest,
    pub to: Digest,
    pub frag: FragType,
    pub seqno: SeqNo,
    pub hostname: Bytes,
}

impl Short2Op {
    pub fn encode(&self, opcode: Opcode, flags: OpFlags) -> Bytes {
        let total = HEADER_SIZE + SHORT2_FIXED + self.hostname.len();
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::encode(opcode, flags, total, &mut buf);
        put_digest(&mut buf, &self.from);
        put_digest(&mut buf, &self.to);
        put_frag(&mut buf, self.frag);
        buf.put_u32_ne(self.seqno.as_u32());
        buf.put_slice(&self.hostname);
        buf.freeze()
    }

    pub fn decode(hdr: &MsgHeader, cur: &mut WireCursor) -> WireResult<Self> {
        check_trailer(hdr, SHORT2_FIXED, 0)?;
        let from = cur.get_digest()?;
        let to = cur.get_digest()?;
        let frag = get_frag(cur)?;
        let seqno = SeqNo::from_wire(cur.get_u32()?);
        let hostname = cur.take_rest();
        Ok(Self {
            from,
            to,
            frag,
            seqno,
            hostname,
        })
    }
}

/// Long-form request, used by open-read-long and open-write-long.
///
/// Carries the marshaled HTTP request, the lookup configuration, and the
/// hostname in its trailer; each blob's length is declared in the fixed
/// part and the hostname takes whatever remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongOp {
    pub digest: Digest,
    pub frag: FragType,
    pub seqno: SeqNo,
    /// Declared object size for open-write-long; zero otherwise.
    pub nbytes: u64,
    /// Advisory seconds to pin the object in cache after write.
    pub pin_time: u32,
    /// Upper bound on data inlined in the reply.
    pub buffer_hint: u32,
    /// Marshaled HTTP request headers (open-read-long) or old info
    /// (open-write-long), possibly empty.
    pub http_blob: Bytes,
    /// Marshaled lookup configuration, possibly empty.
    pub lookup_blob: Bytes,
    /// Trailing hostname, possibly empty.
    pub hostname: Bytes,
}

impl LongOp {
    pub fn encode(&self, opcode: Opcode, flags: OpFlags) -> Bytes {
        let total = HEADER_SIZE
            + LONG_FIXED
            + self.http_blob.len()
            + self.lookup_blob.len()
            + self.hostname.len();
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::encode(opcode, flags, total, &mut buf);
        put_digest(&mut buf, &self.digest);
        put_frag(&mut buf, self.frag);
        buf.put_u32_ne(self.seqno.as_u32());
        buf.put_u64_ne(self.nbytes);
        buf.put_u32_ne(self.pin_time);
        buf.put_u32_ne(self.buffer_hint);
        buf.put_u32_ne(self.http_blob.len() as u32);
        buf.put_u32_ne(self.lookup_blob.len() as u32);
        buf.put_slice(&self.http_blob);
        buf.put_slice(&self.lookup_blob);
        buf.put_slice(&self.hostname);
        buf.freeze()
    }

    pub fn decode(hdr: &MsgHeader, cur: &mut WireCursor) -> WireResult<Self> {
        check_trailer(hdr, LONG_FIXED, 0)?;
        let digest = cur.get_digest()?;
        let frag = get_frag(cur)?;
        let seqno = SeqNo::from_wire(cur.get_u32()?);
        let nbytes = cur.get_u64()?;
        let pin_time = cur.get_u32()?;
        let buffer_hint = cur.get_u32()?;
        let h_len = cur.get_u32()? as usize;
        let c_len = cur.get_u32()? as usize;
        check_trailer(hdr, LONG_FIXED, h_len + c_len)?;
        let http_blob = cur.get_bytes(h_len)?;
        let lookup_blob = cur.get_bytes(c_len)?;
        let hostname = cur.take_rest();
        Ok(Self {
            digest,
            frag,
            seqno,
            nbytes,
            pin_time,
            buffer_hint,
            http_blob,
            lookup_blob,
            hostname,
        })
    }
}

/// Validates that the fixed part plus declared trailers fit the
/// header-declared total length.
fn check_trailer(hdr: &MsgHeader, fixed: usize, trailers: usize) -> WireResult<()> {
    let length = hdr.length as usize;
    if HEADER_SIZE + fixed + trailers > length {
        return Err(WireError::TrailerOverrun {
            fixed,
            trailers,
            length,
        });
    }
    Ok(())
}
