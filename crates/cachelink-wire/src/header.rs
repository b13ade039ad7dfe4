//! Common message header and the byte-order-aware decode cursor.
//!
//! Every wire message opens with a 16-byte header:
//!
//! ```text
//! ┌─────────┬────────────┬────────┬───────┬────────┬──────────┐
//! │ version │ byte-order │ opcode │ flags │ length │ reserved │
//! │ (2 B)   │ (2 B)      │ (2 B)  │ (2 B) │ (4 B)  │ (4 B)    │
//! └─────────┴────────────┴────────┴───────┴────────┴──────────┘
//! ```
//!
//! All integer fields are written in the sender's native byte order. The
//! byte-order field carries the marker `0x0102`; a receiver that reads it
//! as `0x0201` byte-swaps every subsequent multi-byte integer field.
//! Digests and opaque blobs are raw bytes and are never swapped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cachelink_types::{Digest, OpFlags};

use crate::error::{WireError, WireResult};

/// Current protocol version, checked on every inbound message.
pub const PROTOCOL_VERSION: u16 = 3;

/// Byte-order marker as written by the sender.
pub const BYTE_ORDER_MARK: u16 = 0x0102;

/// The marker as seen by a receiver of the opposite byte order.
pub const BYTE_ORDER_MARK_SWAPPED: u16 = 0x0201;

/// Size of the common header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Maximum total message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Operation and control codes carried in the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Cache operations (initiator → responder)
    OpenRead = 1,
    OpenReadLong = 2,
    OpenWrite = 3,
    OpenWriteLong = 4,
    Update = 5,
    Remove = 6,
    Link = 7,
    Deref = 8,

    // Control (responder → initiator)
    OpResult = 9,

    // Data frames (either direction, session-bound)
    ReadBegin = 10,
    ReadReenable = 11,
    ReadDone = 12,
    WriteBegin = 13,
    WriteDone = 14,
    HeaderOnlyUpdate = 15,
    Close = 16,
    Abort = 17,
    Error = 18,
}

impl Opcode {
    /// Decodes an opcode from its wire value.
    pub fn from_wire(v: u16) -> WireResult<Self> {
        Ok(match v {
            1 => Opcode::OpenRead,
            2 => Opcode::OpenReadLong,
            3 => Opcode::OpenWrite,
            4 => Opcode::OpenWriteLong,
            5 => Opcode::Update,
            6 => Opcode::Remove,
            7 => Opcode::Link,
            8 => Opcode::Deref,
            9 => Opcode::OpResult,
            10 => Opcode::ReadBegin,
            11 => Opcode::ReadReenable,
            12 => Opcode::ReadDone,
            13 => Opcode::WriteBegin,
            14 => Opcode::WriteDone,
            15 => Opcode::HeaderOnlyUpdate,
            16 => Opcode::Close,
            17 => Opcode::Abort,
            18 => Opcode::Error,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }

    /// Returns true for request opcodes that expect an [`Opcode::OpResult`]
    /// reply.
    pub fn is_cache_op(self) -> bool {
        matches!(
            self,
            Opcode::OpenRead
                | Opcode::OpenReadLong
                | Opcode::OpenWrite
                | Opcode::OpenWriteLong
                | Opcode::Update
                | Opcode::Remove
                | Opcode::Link
                | Opcode::Deref
        )
    }

    /// Returns true for read-class operations.
    pub fn is_read(self) -> bool {
        matches!(self, Opcode::OpenRead | Opcode::OpenReadLong)
    }

    /// Returns true for write-class operations.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Opcode::OpenWrite | Opcode::OpenWriteLong | Opcode::Update
        )
    }

    /// Returns true for the long (marshaled-state-carrying) request shapes.
    pub fn is_long(self) -> bool {
        matches!(self, Opcode::OpenReadLong | Opcode::OpenWriteLong)
    }
}

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Protocol version.
    pub version: u16,
    /// Operation code.
    pub opcode: Opcode,
    /// Per-request control flags.
    pub flags: OpFlags,
    /// Total message length, header included.
    pub length: u32,
    /// Whether the sender's byte order differs from ours.
    pub swap: bool,
}

impl MsgHeader {
    /// Encodes a header for a message of `total_len` bytes.
    pub fn encode(opcode: Opcode, flags: OpFlags, total_len: usize, buf: &mut BytesMut) {
        buf.put_u16_ne(PROTOCOL_VERSION);
        buf.put_u16_ne(BYTE_ORDER_MARK);
        buf.put_u16_ne(opcode as u16);
        buf.put_u16_ne(flags.bits());
        buf.put_u32_ne(total_len as u32);
        buf.put_u32_ne(0); // reserved
    }

    /// Decodes and validates a header, returning it and the cursor
    /// positioned after it.
    pub fn decode(raw: Bytes) -> WireResult<(MsgHeader, WireCursor)> {
        if raw.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: raw.len(),
            });
        }
        if raw.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge {
                size: raw.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg_len = raw.len();
        let mut cur = WireCursor {
            buf: raw,
            swap: false,
            msg_len,
        };
        let version_raw = cur.get_u16()?;
        let order = cur.get_u16()?;

        // Determine byte order before interpreting anything else: the
        // version itself may arrive swapped.
        let (swap, version) = match order {
            BYTE_ORDER_MARK => (false, version_raw),
            BYTE_ORDER_MARK_SWAPPED => (true, version_raw.swap_bytes()),
            other => return Err(WireError::BadByteOrder(other)),
        };
        cur.swap = swap;

        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }

        let opcode = Opcode::from_wire(cur.get_u16()?)?;
        let flags = OpFlags::from_bits(cur.get_u16()?);
        let length = cur.get_u32()?;
        let _reserved = cur.get_u32()?;

        if length as usize != cur.total_len() {
            return Err(WireError::LengthMismatch {
                declared: length as usize,
                received: cur.total_len(),
            });
        }

        Ok((
            MsgHeader {
                version,
                opcode,
                flags,
                length,
                swap,
            },
            cur,
        ))
    }
}

/// Byte-order-aware read cursor over a received message.
///
/// Integer reads swap when the sender's byte order differs; digest and blob
/// reads never swap.
#[derive(Debug)]
pub struct WireCursor {
    buf: Bytes,
    swap: bool,
    msg_len: usize,
}

impl WireCursor {
    /// Total length of the message this cursor was created over.
    fn total_len(&self) -> usize {
        self.msg_len
    }

    /// Bytes remaining past the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> WireResult<()> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                need: n,
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn get_u16(&mut self) -> WireResult<u16> {
        self.need(2)?;
        let v = self.buf.get_u16_ne();
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn get_u32(&mut self) -> WireResult<u32> {
        self.need(4)?;
        let v = self.buf.get_u32_ne();
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn get_u64(&mut self) -> WireResult<u64> {
        self.need(8)?;
        let v = self.buf.get_u64_ne();
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn get_i32(&mut self) -> WireResult<i32> {
        Ok(self.get_u32()? as i32)
    }

    /// Reads a digest: raw bytes, never swapped.
    pub fn get_digest(&mut self) -> WireResult<Digest> {
        self.need(Digest::SIZE)?;
        let mut b = [0u8; Digest::SIZE];
        self.buf.copy_to_slice(&mut b);
        Ok(Digest::from_bytes(b))
    }

    /// Takes `n` raw bytes without copying.
    pub fn get_bytes(&mut self, n: usize) -> WireResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Takes all remaining bytes.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }
}

/// Byte-order-transparent write helpers shared by the message encoders.
pub(crate) fn put_digest(buf: &mut BytesMut, d: &Digest) {
    buf.put_slice(d.as_bytes());
}
