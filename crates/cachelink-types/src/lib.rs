//! # cachelink-types: Core types for `cachelink`
//!
//! This crate contains the shared vocabulary used across the `cachelink`
//! system:
//! - Content addressing ([`Digest`], [`FragType`], [`CacheKey`])
//! - Peer and sequence identification ([`PeerId`], [`SeqNo`], [`SeqNoGen`])
//! - Operation results ([`ResultCode`], reason codes in [`reason`])
//! - Request flags ([`OpFlags`])
//! - Opaque marshaled HTTP state ([`HttpInfo`])

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

// ============================================================================
// Content Addressing
// ============================================================================

/// 128-bit content digest identifying a cache object.
///
/// Digests are raw bytes, not integers: they are never byte-swapped on the
/// wire, and bucket folding XORs the two 64-bit halves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Size of a digest in bytes.
    pub const SIZE: usize = 16;

    /// Creates a digest from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a digest from two 64-bit words (hi, lo).
    pub fn from_words(hi: u64, lo: u64) -> Self {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&hi.to_be_bytes());
        b[8..].copy_from_slice(&lo.to_be_bytes());
        Self(b)
    }

    /// Returns the raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Folds the digest to a 64-bit value by XOR of its halves.
    pub fn fold(&self) -> u64 {
        let hi = u64::from_be_bytes(self.0[..8].try_into().expect("8-byte slice"));
        let lo = u64::from_be_bytes(self.0[8..].try_into().expect("8-byte slice"));
        hi ^ lo
    }

    /// Returns a bucket index in `[0, buckets)` for a power-of-two table.
    pub fn bucket(&self, buckets: usize) -> usize {
        debug_assert!(buckets.is_power_of_two());
        let f = self.fold();
        (((f >> 32) ^ (f & 0xFFFF_FFFF)) as usize) & (buckets - 1)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..")
    }
}

/// Fragment type: selects the marshaling rules for a cache object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FragType {
    /// HTTP object: carries marshaled headers and a lookup configuration.
    Http,
    /// Generic object: carries only an object size.
    #[default]
    Generic,
}

impl FragType {
    /// Wire encoding of the fragment type.
    pub fn to_wire(self) -> u16 {
        match self {
            FragType::Http => 1,
            FragType::Generic => 2,
        }
    }

    /// Decodes a fragment type from its wire value.
    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            1 => Some(FragType::Http),
            2 => Some(FragType::Generic),
            _ => None,
        }
    }
}

/// The cache key on both sides of an RPC: digest plus fragment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Content digest.
    pub digest: Digest,
    /// Fragment type tag.
    pub frag_type: FragType,
}

impl CacheKey {
    /// Creates a new cache key.
    pub fn new(digest: Digest, frag_type: FragType) -> Self {
        Self { digest, frag_type }
    }
}

// ============================================================================
// Peers and Sequence Numbers
// ============================================================================

/// Identifier of a peer node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Monotone 32-bit request sequence number.
///
/// Zero is reserved to mean "no reply expected" and is never generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNo(u32);

impl SeqNo {
    /// The reserved "no reply expected" value.
    pub const NONE: SeqNo = SeqNo(0);

    /// Creates a sequence number from its wire value.
    pub fn from_wire(v: u32) -> Self {
        Self(v)
    }

    /// Returns the wire value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true if this is the reserved no-reply value.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic generator of non-zero sequence numbers.
///
/// Wraps around on overflow; the zero value is skipped by retrying.
#[derive(Debug)]
pub struct SeqNoGen {
    next: AtomicU32,
}

impl SeqNoGen {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Returns the next sequence number, never zero.
    pub fn next(&self) -> SeqNo {
        loop {
            let v = self.next.fetch_add(1, Ordering::Relaxed);
            if v != 0 {
                return SeqNo(v);
            }
        }
    }
}

impl Default for SeqNoGen {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Results and Reasons
// ============================================================================

/// Terminal result code of a cache operation, as carried in a reply.
///
/// Failed variants are accompanied by a negative reason code (see
/// [`reason`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    OpenRead,
    OpenReadFailed,
    OpenWrite,
    OpenWriteFailed,
    Remove,
    RemoveFailed,
    Link,
    LinkFailed,
    Deref,
    DerefFailed,
    Lookup,
    LookupFailed,
    UpdateFailed,
}

impl ResultCode {
    /// Wire encoding of the result code.
    pub fn to_wire(self) -> u16 {
        match self {
            ResultCode::OpenRead => 1,
            ResultCode::OpenReadFailed => 2,
            ResultCode::OpenWrite => 3,
            ResultCode::OpenWriteFailed => 4,
            ResultCode::Remove => 5,
            ResultCode::RemoveFailed => 6,
            ResultCode::Link => 7,
            ResultCode::LinkFailed => 8,
            ResultCode::Deref => 9,
            ResultCode::DerefFailed => 10,
            ResultCode::Lookup => 11,
            ResultCode::LookupFailed => 12,
            ResultCode::UpdateFailed => 13,
        }
    }

    /// Decodes a result code from its wire value.
    pub fn from_wire(v: u16) -> Option<Self> {
        Some(match v {
            1 => ResultCode::OpenRead,
            2 => ResultCode::OpenReadFailed,
            3 => ResultCode::OpenWrite,
            4 => ResultCode::OpenWriteFailed,
            5 => ResultCode::Remove,
            6 => ResultCode::RemoveFailed,
            7 => ResultCode::Link,
            8 => ResultCode::LinkFailed,
            9 => ResultCode::Deref,
            10 => ResultCode::DerefFailed,
            11 => ResultCode::Lookup,
            12 => ResultCode::LookupFailed,
            13 => ResultCode::UpdateFailed,
            _ => return None,
        })
    }

    /// Returns true if this result opens a virtual connection.
    pub fn is_open(self) -> bool {
        matches!(self, ResultCode::OpenRead | ResultCode::OpenWrite)
    }

    /// Returns true if this result reports a failure.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResultCode::OpenReadFailed
                | ResultCode::OpenWriteFailed
                | ResultCode::RemoveFailed
                | ResultCode::LinkFailed
                | ResultCode::DerefFailed
                | ResultCode::LookupFailed
                | ResultCode::UpdateFailed
        )
    }

    /// Returns the failed counterpart of a success result.
    pub fn failed(self) -> Self {
        match self {
            ResultCode::OpenRead => ResultCode::OpenReadFailed,
            ResultCode::OpenWrite => ResultCode::OpenWriteFailed,
            ResultCode::Remove => ResultCode::RemoveFailed,
            ResultCode::Link => ResultCode::LinkFailed,
            ResultCode::Deref => ResultCode::DerefFailed,
            ResultCode::Lookup => ResultCode::LookupFailed,
            other => other,
        }
    }
}

/// Negative reason codes carried in failed replies.
pub mod reason {
    /// The operation deadline expired before a reply arrived.
    pub const CLUSTER_OP_TIMEOUT: i32 = -1001;
    /// The target peer went down while the operation was outstanding.
    pub const CLUSTER_NO_MACHINE: i32 = -1002;
    /// The transport refused the send.
    pub const CLUSTER_NOT_READY: i32 = -1003;
    /// A protocol error terminated the session.
    pub const CLUSTER_PROTOCOL: i32 = -1004;
    /// HTTP state unmarshal failed or the writer aborted mid-stream.
    pub const HTTP_ERROR: i32 = -1005;
    /// The cache has no document under the requested key.
    pub const CACHE_NO_DOC: i32 = -2001;
    /// The document is locked by another writer.
    pub const CACHE_DOC_BUSY: i32 = -2002;
}

/// Per-request control flags carried in the common wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(u16);

impl OpFlags {
    /// Overwrite an existing object on open-write.
    pub const OVERWRITE: OpFlags = OpFlags(1 << 0);
    /// Long open-write carries marshaled old HTTP info in its trailer.
    pub const HAVE_OLDINFO: OpFlags = OpFlags(1 << 1);
    /// Allow multiple simultaneous writers.
    pub const ALLOW_MULTIPLE_WRITES: OpFlags = OpFlags(1 << 2);
    /// Remove user-agent entries as part of a remove.
    pub const REMOVE_USER_AGENTS: OpFlags = OpFlags(1 << 3);
    /// Remove link entries as part of a remove.
    pub const REMOVE_LINK: OpFlags = OpFlags(1 << 4);
    /// The request carries conditional headers (If-*, Range).
    pub const CONDITIONAL: OpFlags = OpFlags(1 << 5);
    /// The request is a purge/delete; suppresses read-to-write salvage.
    pub const PURGE: OpFlags = OpFlags(1 << 6);

    pub const fn empty() -> Self {
        OpFlags(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        OpFlags(bits)
    }

    pub fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: OpFlags) -> Self {
        OpFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

// ============================================================================
// Opaque HTTP Info
// ============================================================================

/// Error produced when an [`HttpInfo`] blob fails validation.
#[derive(Debug, Error)]
pub enum HttpInfoError {
    /// The blob is shorter than its fixed prefix.
    #[error("http info truncated: {0} bytes")]
    Truncated(usize),

    /// The leading magic word is wrong.
    #[error("bad http info magic: 0x{0:08x}")]
    BadMagic(u32),

    /// The declared body length disagrees with the blob length.
    #[error("http info length mismatch: declared {declared}, have {have}")]
    LengthMismatch { declared: usize, have: usize },
}

/// Opaque marshaled HTTP state (headers plus alternate metadata).
///
/// The engine never inspects the body; it only validates the envelope so a
/// corrupted blob is caught before being handed to the cache. The envelope
/// is a magic word and a body length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpInfo {
    body: Bytes,
}

impl HttpInfo {
    /// Leading magic word of a marshaled blob.
    pub const MAGIC: u32 = 0xFEED_BABE;

    /// Size of the envelope (magic + body length).
    pub const ENVELOPE: usize = 8;

    /// Wraps raw HTTP state in a marshalable blob.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }

    /// Returns the opaque body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the marshaled length of the blob.
    pub fn marshal_len(&self) -> usize {
        Self::ENVELOPE + self.body.len()
    }

    /// Marshals the blob into a buffer.
    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::MAGIC);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Unmarshals a blob, validating the envelope.
    pub fn unmarshal(mut raw: Bytes) -> Result<Self, HttpInfoError> {
        if raw.len() < Self::ENVELOPE {
            return Err(HttpInfoError::Truncated(raw.len()));
        }
        let magic = raw.get_u32();
        if magic != Self::MAGIC {
            return Err(HttpInfoError::BadMagic(magic));
        }
        let declared = raw.get_u32() as usize;
        if declared != raw.len() {
            return Err(HttpInfoError::LengthMismatch {
                declared,
                have: raw.len(),
            });
        }
        Ok(Self { body: raw })
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn test_digest_fold_and_bucket() {
        let d = Digest::from_words(0xAAAA_BBBB_CCCC_DDDD, 0x1111_2222_3333_4444);
        assert_eq!(d.fold(), 0xAAAA_BBBB_CCCC_DDDD ^ 0x1111_2222_3333_4444);
        assert!(d.bucket(256) < 256);

        // Bucket is stable
        assert_eq!(d.bucket(256), d.bucket(256));
    }

    #[test]
    fn test_seqno_gen_skips_zero() {
        let g = SeqNoGen::new();
        let first = g.next();
        assert!(!first.is_none());

        // Force the counter to the wrap point and confirm zero is skipped
        g.next.store(u32::MAX, Ordering::Relaxed);
        let a = g.next();
        let b = g.next();
        assert_eq!(a.as_u32(), u32::MAX);
        assert!(!b.is_none());
    }

    #[test]
    fn test_result_code_roundtrip() {
        for code in [
            ResultCode::OpenRead,
            ResultCode::OpenReadFailed,
            ResultCode::OpenWrite,
            ResultCode::OpenWriteFailed,
            ResultCode::Remove,
            ResultCode::RemoveFailed,
            ResultCode::Link,
            ResultCode::LinkFailed,
            ResultCode::Deref,
            ResultCode::DerefFailed,
            ResultCode::Lookup,
            ResultCode::LookupFailed,
            ResultCode::UpdateFailed,
        ] {
            assert_eq!(ResultCode::from_wire(code.to_wire()), Some(code));
        }
        assert_eq!(ResultCode::from_wire(0), None);
        assert_eq!(ResultCode::from_wire(99), None);
    }

    #[test]
    fn test_result_code_classes() {
        assert!(ResultCode::OpenRead.is_open());
        assert!(!ResultCode::OpenRead.is_failure());
        assert!(ResultCode::OpenReadFailed.is_failure());
        assert_eq!(ResultCode::OpenRead.failed(), ResultCode::OpenReadFailed);
        assert_eq!(ResultCode::Link.failed(), ResultCode::LinkFailed);
    }

    #[test]
    fn test_op_flags() {
        let f = OpFlags::OVERWRITE | OpFlags::PURGE;
        assert!(f.contains(OpFlags::OVERWRITE));
        assert!(f.contains(OpFlags::PURGE));
        assert!(!f.contains(OpFlags::CONDITIONAL));
        assert_eq!(OpFlags::from_bits(f.bits()), f);
    }

    #[test]
    fn test_http_info_roundtrip() {
        let info = HttpInfo::new(Bytes::from_static(b"HTTP/1.1 200 OK\r\n"));
        let mut buf = BytesMut::new();
        info.marshal(&mut buf);
        assert_eq!(buf.len(), info.marshal_len());

        let back = HttpInfo::unmarshal(buf.freeze()).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_http_info_rejects_garbage() {
        assert!(matches!(
            HttpInfo::unmarshal(Bytes::from_static(b"xy")),
            Err(HttpInfoError::Truncated(2))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u32(0);
        assert!(matches!(
            HttpInfo::unmarshal(buf.freeze()),
            Err(HttpInfoError::BadMagic(0xDEAD_BEEF))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(HttpInfo::MAGIC);
        buf.put_u32(10);
        buf.put_slice(b"abc");
        assert!(matches!(
            HttpInfo::unmarshal(buf.freeze()),
            Err(HttpInfoError::LengthMismatch {
                declared: 10,
                have: 3
            })
        ));
    }

    #[test]
    fn test_frag_type_wire() {
        assert_eq!(FragType::from_wire(FragType::Http.to_wire()), Some(FragType::Http));
        assert_eq!(
            FragType::from_wire(FragType::Generic.to_wire()),
            Some(FragType::Generic)
        );
        assert_eq!(FragType::from_wire(0), None);
    }
}
