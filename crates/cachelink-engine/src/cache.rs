//! The local cache engine as consumed by the responder.
//!
//! All cache calls are asynchronous: the engine passes a continuation id
//! and later drains completion events via [`CacheBackend::poll_events`].
//! Virtual connections handed back by a successful open are driven
//! through the `vc_*` operations; their I/O progress arrives as events
//! against the same continuation id.

use bytes::Bytes;
use cachelink_types::{CacheKey, HttpInfo};

/// Opaque handle to a cache virtual connection owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheVcId(pub u64);

/// Continuation key the engine hands to the backend; completions and VC
/// events are delivered against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContId(pub u64);

/// Completion and VC events produced by the backend.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    OpenRead { vc: CacheVcId },
    OpenReadFailed { reason: i32 },
    OpenWrite { vc: CacheVcId },
    OpenWriteFailed { reason: i32 },
    RemoveDone,
    RemoveFailed { reason: i32 },
    LinkDone,
    LinkFailed { reason: i32 },
    DerefDone,
    DerefFailed { reason: i32 },

    /// Read VIO has bytes available.
    ReadReady,
    /// Read VIO reached its requested byte count.
    ReadComplete,
    /// Write VIO consumed appended bytes and can take more.
    WriteReady,
    /// Write VIO reached its requested byte count.
    WriteComplete,
    /// The object's writer went away mid-read, or the stream ended early.
    Eos,
    /// The VIO failed.
    Error { reason: i32 },
}

/// Options for an open-write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Overwrite an existing object.
    pub overwrite: bool,
    /// Allow multiple simultaneous writers.
    pub allow_multiple: bool,
    /// Advisory seconds to pin the object after write.
    pub pin_time: u32,
    /// Previous HTTP info for an updating write.
    pub old_info: Option<HttpInfo>,
}

/// Options for a remove.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Also remove user-agent entries.
    pub user_agents: bool,
    /// Also remove link entries.
    pub link: bool,
}

/// The local cache engine seam.
///
/// Handle-based: the backend owns every VC; the engine refers to them by
/// [`CacheVcId`] and never holds backend state across events.
pub trait CacheBackend {
    // ------------------------------------------------------------------
    // Asynchronous cache operations
    // ------------------------------------------------------------------

    fn open_read(&mut self, cont: ContId, key: &CacheKey, hostname: &[u8]);

    /// HTTP open-read with the marshaled request and lookup configuration.
    fn open_read_http(
        &mut self,
        cont: ContId,
        key: &CacheKey,
        http_request: &Bytes,
        lookup_config: &Bytes,
        hostname: &[u8],
    );

    fn open_write(&mut self, cont: ContId, key: &CacheKey, opts: &WriteOptions, hostname: &[u8]);

    fn remove(&mut self, cont: ContId, key: &CacheKey, opts: &RemoveOptions, hostname: &[u8]);

    fn link(&mut self, cont: ContId, from: &CacheKey, to: &CacheKey, hostname: &[u8]);

    fn deref(&mut self, cont: ContId, key: &CacheKey, hostname: &[u8]);

    /// Cancels a pending operation; no further events for `cont`.
    fn cancel(&mut self, cont: ContId);

    // ------------------------------------------------------------------
    // Virtual connection surface
    // ------------------------------------------------------------------

    /// Total object size behind a read VC.
    fn vc_object_size(&self, vc: CacheVcId) -> u64;

    /// Cache-level open flags, reflected to the initiator in the reply
    /// `reason` field on success.
    fn vc_open_flags(&self, vc: CacheVcId) -> u32;

    /// True while another writer is still filling the object.
    fn vc_is_read_from_writer(&self, vc: CacheVcId) -> bool;

    fn vc_get_http_info(&self, vc: CacheVcId) -> Option<HttpInfo>;

    fn vc_set_http_info(&mut self, vc: CacheVcId, info: HttpInfo);

    /// Starts a read VIO of `nbytes` from the current position.
    fn vc_do_io_read(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64);

    /// Starts a positioned read VIO.
    fn vc_do_io_pread(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64, offset: u64);

    /// Starts a write VIO of `nbytes`.
    fn vc_do_io_write(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64);

    /// Appends inbound data to the write VIO's buffer.
    fn vc_append(&mut self, vc: CacheVcId, data: Bytes);

    /// Drains whatever the read VIO has made available.
    fn vc_take_read(&mut self, vc: CacheVcId) -> Bytes;

    /// Reenables the VIO after the engine consumed or supplied data.
    fn vc_reenable(&mut self, vc: CacheVcId);

    /// Finalises the write VIO's byte count (stream close).
    fn vc_set_io_nbytes(&mut self, vc: CacheVcId, nbytes: u64);

    /// Bytes the VIO has completed so far.
    fn vc_io_done(&self, vc: CacheVcId) -> u64;

    /// Closes the VC, optionally with an error reason. Must be called
    /// exactly once per opened VC.
    fn vc_do_io_close(&mut self, vc: CacheVcId, reason: Option<i32>);

    // ------------------------------------------------------------------
    // Event delivery
    // ------------------------------------------------------------------

    /// Drains pending completion and VC events.
    fn poll_events(&mut self) -> Vec<(ContId, CacheEvent)>;
}
