//! Data frames exchanged after a successful open, in either direction.
//!
//! The streamer's pull discipline rides on these: the receiver reenables
//! the sender (`READ_REENABLE`, or implicitly via `WRITE_DONE` VIO
//! reenable) and the sender responds with exactly one more frame.

use bytes::{BufMut, Bytes, BytesMut};
use cachelink_types::OpFlags;

use crate::error::{WireError, WireResult};
use crate::header::{MsgHeader, Opcode, WireCursor, HEADER_SIZE};

/// A session-bound data or stream-control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMsg {
    /// Consumer asks the responder to start reading `nbytes` at `offset`.
    ReadBegin { offset: u64, nbytes: u64 },
    /// Consumer is ready for the next read chunk.
    ReadReenable,
    /// One chunk of object data from the responder.
    ReadDone { payload: Bytes },
    /// Producer announces a write of `nbytes`, optionally preceded by
    /// marshaled HTTP info.
    WriteBegin { nbytes: u64, http_info: Bytes },
    /// One chunk of write payload from the producer.
    WriteDone { payload: Bytes },
    /// Header-only update: swap HTTP info, no data may have flowed.
    HeaderOnlyUpdate { http_info: Bytes },
    /// Producer finalises the write at `nbytes` total.
    Close { nbytes: u64 },
    /// Either side abandons the stream.
    Abort,
    /// Either side reports a fatal condition with a reason code.
    Error { code: i32 },
}

impl DataMsg {
    /// Returns the opcode for this frame.
    pub fn opcode(&self) -> Opcode {
        match self {
            DataMsg::ReadBegin { .. } => Opcode::ReadBegin,
            DataMsg::ReadReenable => Opcode::ReadReenable,
            DataMsg::ReadDone { .. } => Opcode::ReadDone,
            DataMsg::WriteBegin { .. } => Opcode::WriteBegin,
            DataMsg::WriteDone { .. } => Opcode::WriteDone,
            DataMsg::HeaderOnlyUpdate { .. } => Opcode::HeaderOnlyUpdate,
            DataMsg::Close { .. } => Opcode::Close,
            DataMsg::Abort => Opcode::Abort,
            DataMsg::Error { .. } => Opcode::Error,
        }
    }

    pub fn encode(&self) -> Bytes {
        let (fixed, trailer): (usize, usize) = match self {
            DataMsg::ReadBegin { .. } => (16, 0),
            DataMsg::ReadReenable | DataMsg::Abort => (0, 0),
            DataMsg::ReadDone { payload } | DataMsg::WriteDone { payload } => (0, payload.len()),
            DataMsg::WriteBegin { http_info, .. } => (12, http_info.len()),
            DataMsg::HeaderOnlyUpdate { http_info } => (8, http_info.len()),
            DataMsg::Close { .. } => (8, 0),
            DataMsg::Error { .. } => (4, 0),
        };
        let total = HEADER_SIZE + fixed + trailer;
        let mut buf = BytesMut::with_capacity(total);
        MsgHeader::encode(self.opcode(), OpFlags::empty(), total, &mut buf);
        match self {
            DataMsg::ReadBegin { offset, nbytes } => {
                buf.put_u64_ne(*offset);
                buf.put_u64_ne(*nbytes);
            }
            DataMsg::ReadReenable | DataMsg::Abort => {}
            DataMsg::ReadDone { payload } | DataMsg::WriteDone { payload } => {
                buf.put_slice(payload);
            }
            DataMsg::WriteBegin { nbytes, http_info } => {
                buf.put_u64_ne(*nbytes);
                buf.put_u32_ne(http_info.len() as u32);
                buf.put_slice(http_info);
            }
            DataMsg::HeaderOnlyUpdate { http_info } => {
                buf.put_u32_ne(http_info.len() as u32);
                buf.put_u32_ne(0); // d_len, always zero for a header update
                buf.put_slice(http_info);
            }
            DataMsg::Close { nbytes } => {
                buf.put_u64_ne(*nbytes);
            }
            DataMsg::Error { code } => {
                buf.put_u32_ne(*code as u32);
            }
        }
        buf.freeze()
    }

    pub fn decode(hdr: &MsgHeader, cur: &mut WireCursor) -> WireResult<Self> {
        Ok(match hdr.opcode {
            Opcode::ReadBegin => DataMsg::ReadBegin {
                offset: cur.get_u64()?,
                nbytes: cur.get_u64()?,
            },
            Opcode::ReadReenable => DataMsg::ReadReenable,
            Opcode::ReadDone => DataMsg::ReadDone {
                payload: cur.take_rest(),
            },
            Opcode::WriteBegin => {
                let nbytes = cur.get_u64()?;
                let h_len = cur.get_u32()? as usize;
                let http_info = cur.get_bytes(h_len)?;
                if cur.remaining() != 0 {
                    return Err(WireError::LengthMismatch {
                        declared: hdr.length as usize,
                        received: hdr.length as usize + cur.remaining(),
                    });
                }
                DataMsg::WriteBegin { nbytes, http_info }
            }
            Opcode::WriteDone => DataMsg::WriteDone {
                payload: cur.take_rest(),
            },
            Opcode::HeaderOnlyUpdate => {
                let h_len = cur.get_u32()? as usize;
                let d_len = cur.get_u32()?;
                if d_len != 0 {
                    return Err(WireError::InvalidField {
                        field: "header_update_d_len",
                        value: u64::from(d_len),
                    });
                }
                let http_info = cur.get_bytes(h_len)?;
                DataMsg::HeaderOnlyUpdate { http_info }
            }
            Opcode::Close => DataMsg::Close {
                nbytes: cur.get_u64()?,
            },
            Opcode::Abort => DataMsg::Abort,
            Opcode::Error => DataMsg::Error {
                code: cur.get_i32()?,
            },
            other => {
                return Err(WireError::UnknownOpcode(other as u16));
            }
        })
    }
}
