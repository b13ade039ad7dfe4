//! In-memory cache backend for simulation.
//!
//! `MemCache` implements the engine's cache seam over a hash map of
//! objects. Read VIOs hand out data in bounded chunks (the window is
//! configurable) so the streaming paths get exercised the way a disk
//! cache would exercise them; write VIOs commit their object only when
//! the VIO completes cleanly.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use cachelink_engine::cache::{
    CacheBackend, CacheEvent, CacheVcId, ContId, RemoveOptions, WriteOptions,
};
use cachelink_types::{reason, CacheKey, HttpInfo};

/// Default read window per reenable (256 KiB).
const DEFAULT_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    http: Option<HttpInfo>,
    body: Bytes,
}

#[derive(Debug)]
enum VcKind {
    Read {
        data: Bytes,
        http: Option<HttpInfo>,
        pos: usize,
        nbytes: u64,
        served: u64,
        avail: VecDeque<Bytes>,
    },
    Write {
        committed: BytesMut,
        pending: VecDeque<Bytes>,
        nbytes: Option<u64>,
        done: u64,
        http: Option<HttpInfo>,
        vio: bool,
    },
}

#[derive(Debug)]
struct MemVc {
    key: CacheKey,
    cont: Option<ContId>,
    kind: VcKind,
}

struct MemCacheInner {
    objects: HashMap<CacheKey, StoredObject>,
    links: HashMap<CacheKey, CacheKey>,
    vcs: HashMap<u64, MemVc>,
    next_vc: u64,
    events: VecDeque<(ContId, CacheEvent)>,
    chunk: usize,
    writers: HashSet<CacheKey>,
}

/// Shared-handle in-memory cache. Clone it to keep an inspection handle
/// while the engine owns the backend.
#[derive(Clone)]
pub struct MemCache {
    inner: Rc<RefCell<MemCacheInner>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemCacheInner {
                objects: HashMap::new(),
                links: HashMap::new(),
                vcs: HashMap::new(),
                next_vc: 0,
                events: VecDeque::new(),
                chunk: DEFAULT_CHUNK,
                writers: HashSet::new(),
            })),
        }
    }

    /// Sets the read window handed out per reenable.
    pub fn set_chunk(&self, chunk: usize) {
        self.inner.borrow_mut().chunk = chunk.max(1);
    }

    /// Seeds an object directly into the store.
    pub fn insert_object(&self, key: CacheKey, http: Option<HttpInfo>, body: impl Into<Bytes>) {
        self.inner.borrow_mut().objects.insert(
            key,
            StoredObject {
                http,
                body: body.into(),
            },
        );
    }

    /// Returns a stored object's HTTP info and body.
    pub fn object(&self, key: &CacheKey) -> Option<(Option<HttpInfo>, Bytes)> {
        self.inner
            .borrow()
            .objects
            .get(key)
            .map(|o| (o.http.clone(), o.body.clone()))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.borrow().objects.contains_key(key)
    }

    /// True while completion events await delivery.
    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().events.is_empty()
    }

    /// Number of live VCs. Leak detection in tests.
    pub fn open_vcs(&self) -> usize {
        self.inner.borrow().vcs.len()
    }
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCacheInner {
    fn emit(&mut self, cont: ContId, event: CacheEvent) {
        self.events.push_back((cont, event));
    }

    fn alloc_vc(&mut self, vc: MemVc) -> CacheVcId {
        self.next_vc += 1;
        let id = self.next_vc;
        self.vcs.insert(id, vc);
        CacheVcId(id)
    }

    /// Makes the next read window available and reports VIO progress.
    fn read_progress(&mut self, vc_id: u64) {
        let chunk = self.chunk;
        let Some(vc) = self.vcs.get_mut(&vc_id) else {
            return;
        };
        let Some(cont) = vc.cont else {
            return;
        };
        let VcKind::Read {
            data,
            pos,
            nbytes,
            served,
            avail,
            ..
        } = &mut vc.kind
        else {
            return;
        };
        if *nbytes == 0 {
            self.events.push_back((cont, CacheEvent::ReadComplete));
            return;
        }

        let want = (*nbytes - *served) as usize;
        let left = data.len().saturating_sub(*pos);
        let n = chunk.min(want).min(left);
        if n > 0 {
            avail.push_back(data.slice(*pos..*pos + n));
            *pos += n;
            *served += n as u64;
        }

        let event = if *served >= *nbytes {
            CacheEvent::ReadComplete
        } else if n == 0 {
            // The object ran out before the VIO was satisfied.
            CacheEvent::Eos
        } else {
            CacheEvent::ReadReady
        };
        self.events.push_back((cont, event));
    }

    /// Consumes appended write data and reports VIO progress.
    fn write_progress(&mut self, vc_id: u64) {
        let Some(vc) = self.vcs.get_mut(&vc_id) else {
            return;
        };
        let Some(cont) = vc.cont else {
            return;
        };
        let VcKind::Write {
            committed,
            pending,
            nbytes,
            done,
            vio,
            ..
        } = &mut vc.kind
        else {
            return;
        };
        if !*vio {
            return;
        }
        while let Some(b) = pending.pop_front() {
            *done += b.len() as u64;
            committed.extend_from_slice(&b);
        }
        let event = if nbytes.is_some_and(|n| *done >= n) {
            CacheEvent::WriteComplete
        } else {
            CacheEvent::WriteReady
        };
        self.events.push_back((cont, event));
    }
}

impl CacheBackend for MemCache {
    fn open_read(&mut self, cont: ContId, key: &CacheKey, _hostname: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        match inner.objects.get(key).cloned() {
            Some(obj) => {
                let vc = inner.alloc_vc(MemVc {
                    key: *key,
                    cont: Some(cont),
                    kind: VcKind::Read {
                        data: obj.body,
                        http: obj.http,
                        pos: 0,
                        nbytes: 0,
                        served: 0,
                        avail: VecDeque::new(),
                    },
                });
                inner.emit(cont, CacheEvent::OpenRead { vc });
            }
            None => inner.emit(
                cont,
                CacheEvent::OpenReadFailed {
                    reason: reason::CACHE_NO_DOC,
                },
            ),
        }
    }

    fn open_read_http(
        &mut self,
        cont: ContId,
        key: &CacheKey,
        _http_request: &Bytes,
        _lookup_config: &Bytes,
        hostname: &[u8],
    ) {
        // The simulated store keys purely on the digest; the marshaled
        // request and lookup configuration only matter to a real HTTP
        // cache's alternate selection.
        self.open_read(cont, key, hostname);
    }

    fn open_write(&mut self, cont: ContId, key: &CacheKey, opts: &WriteOptions, _hostname: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.writers.contains(key) && !opts.allow_multiple {
            inner.emit(
                cont,
                CacheEvent::OpenWriteFailed {
                    reason: reason::CACHE_DOC_BUSY,
                },
            );
            return;
        }
        if inner.objects.contains_key(key) && !opts.overwrite && opts.old_info.is_none() {
            inner.emit(
                cont,
                CacheEvent::OpenWriteFailed {
                    reason: reason::CACHE_DOC_BUSY,
                },
            );
            return;
        }
        inner.writers.insert(*key);
        let vc = inner.alloc_vc(MemVc {
            key: *key,
            cont: Some(cont),
            kind: VcKind::Write {
                committed: BytesMut::new(),
                pending: VecDeque::new(),
                nbytes: None,
                done: 0,
                http: opts.old_info.clone(),
                vio: false,
            },
        });
        inner.emit(cont, CacheEvent::OpenWrite { vc });
    }

    fn remove(&mut self, cont: ContId, key: &CacheKey, _opts: &RemoveOptions, _hostname: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.objects.remove(key).is_some() {
            inner.links.remove(key);
            inner.emit(cont, CacheEvent::RemoveDone);
        } else {
            inner.emit(
                cont,
                CacheEvent::RemoveFailed {
                    reason: reason::CACHE_NO_DOC,
                },
            );
        }
    }

    fn link(&mut self, cont: ContId, from: &CacheKey, to: &CacheKey, _hostname: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.links.insert(*from, *to);
        inner.emit(cont, CacheEvent::LinkDone);
    }

    fn deref(&mut self, cont: ContId, key: &CacheKey, _hostname: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.links.remove(key).is_some() {
            inner.emit(cont, CacheEvent::DerefDone);
        } else {
            inner.emit(
                cont,
                CacheEvent::DerefFailed {
                    reason: reason::CACHE_NO_DOC,
                },
            );
        }
    }

    fn cancel(&mut self, cont: ContId) {
        let mut inner = self.inner.borrow_mut();
        // Drop undelivered completions, releasing any VC they carried.
        let mut kept = VecDeque::new();
        while let Some((c, ev)) = inner.events.pop_front() {
            if c != cont {
                kept.push_back((c, ev));
                continue;
            }
            if let CacheEvent::OpenRead { vc } | CacheEvent::OpenWrite { vc } = ev {
                if let Some(dead) = inner.vcs.remove(&vc.0) {
                    inner.writers.remove(&dead.key);
                }
            }
        }
        inner.events = kept;
        // Detach the continuation from any live VC.
        for vc in inner.vcs.values_mut() {
            if vc.cont == Some(cont) {
                vc.cont = None;
            }
        }
    }

    fn vc_object_size(&self, vc: CacheVcId) -> u64 {
        match self.inner.borrow().vcs.get(&vc.0).map(|v| &v.kind) {
            Some(VcKind::Read { data, .. }) => data.len() as u64,
            _ => 0,
        }
    }

    fn vc_open_flags(&self, _vc: CacheVcId) -> u32 {
        0
    }

    fn vc_is_read_from_writer(&self, vc: CacheVcId) -> bool {
        let inner = self.inner.borrow();
        inner
            .vcs
            .get(&vc.0)
            .is_some_and(|v| inner.writers.contains(&v.key))
    }

    fn vc_get_http_info(&self, vc: CacheVcId) -> Option<HttpInfo> {
        match self.inner.borrow().vcs.get(&vc.0).map(|v| &v.kind) {
            Some(VcKind::Read { http, .. }) => http.clone(),
            Some(VcKind::Write { http, .. }) => http.clone(),
            None => None,
        }
    }

    fn vc_set_http_info(&mut self, vc: CacheVcId, info: HttpInfo) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            match &mut v.kind {
                VcKind::Read { http, .. } | VcKind::Write { http, .. } => *http = Some(info),
            }
        }
    }

    fn vc_do_io_read(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            v.cont = Some(cont);
            if let VcKind::Read { nbytes: n, served, .. } = &mut v.kind {
                *n = nbytes;
                *served = 0;
            }
        }
        inner.read_progress(vc.0);
    }

    fn vc_do_io_pread(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64, offset: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            v.cont = Some(cont);
            if let VcKind::Read {
                nbytes: n,
                served,
                pos,
                data,
                ..
            } = &mut v.kind
            {
                *n = nbytes;
                *served = 0;
                *pos = (offset as usize).min(data.len());
            }
        }
        inner.read_progress(vc.0);
    }

    fn vc_do_io_write(&mut self, cont: ContId, vc: CacheVcId, nbytes: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            v.cont = Some(cont);
            if let VcKind::Write { nbytes: n, vio, .. } = &mut v.kind {
                *n = Some(nbytes);
                *vio = true;
            }
        }
        inner.write_progress(vc.0);
    }

    fn vc_append(&mut self, vc: CacheVcId, data: Bytes) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            if let VcKind::Write { pending, .. } = &mut v.kind {
                pending.push_back(data);
            }
        }
    }

    fn vc_take_read(&mut self, vc: CacheVcId) -> Bytes {
        let mut inner = self.inner.borrow_mut();
        let Some(v) = inner.vcs.get_mut(&vc.0) else {
            return Bytes::new();
        };
        let VcKind::Read { avail, .. } = &mut v.kind else {
            return Bytes::new();
        };
        if avail.len() == 1 {
            return avail.pop_front().unwrap_or_default();
        }
        let total: usize = avail.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        while let Some(b) = avail.pop_front() {
            out.extend_from_slice(&b);
        }
        out.freeze()
    }

    fn vc_reenable(&mut self, vc: CacheVcId) {
        let mut inner = self.inner.borrow_mut();
        let is_read = matches!(
            inner.vcs.get(&vc.0).map(|v| &v.kind),
            Some(VcKind::Read { .. })
        );
        if is_read {
            inner.read_progress(vc.0);
        } else {
            inner.write_progress(vc.0);
        }
    }

    fn vc_set_io_nbytes(&mut self, vc: CacheVcId, nbytes: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.vcs.get_mut(&vc.0) {
            if let VcKind::Write { nbytes: n, .. } = &mut v.kind {
                *n = Some(nbytes);
            }
        }
    }

    fn vc_io_done(&self, vc: CacheVcId) -> u64 {
        match self.inner.borrow().vcs.get(&vc.0).map(|v| &v.kind) {
            Some(VcKind::Write { done, .. }) => *done,
            _ => 0,
        }
    }

    fn vc_do_io_close(&mut self, vc: CacheVcId, close_reason: Option<i32>) {
        let mut inner = self.inner.borrow_mut();
        let Some(v) = inner.vcs.remove(&vc.0) else {
            return;
        };
        let key = v.key;
        if let VcKind::Write {
            mut committed,
            mut pending,
            nbytes,
            mut done,
            http,
            vio,
        } = v.kind
        {
            inner.writers.remove(&key);
            if close_reason.is_some() {
                return; // aborted write, nothing committed
            }
            // Late appends that arrived with the close.
            while let Some(b) = pending.pop_front() {
                done += b.len() as u64;
                committed.extend_from_slice(&b);
            }
            if vio && nbytes.is_some_and(|n| done >= n) {
                inner.objects.insert(
                    key,
                    StoredObject {
                        http,
                        body: committed.freeze(),
                    },
                );
            } else if !vio && committed.is_empty() {
                if let Some(info) = http {
                    // Header-only update of the stored object.
                    match inner.objects.get_mut(&key) {
                        Some(obj) => obj.http = Some(info),
                        None => {
                            inner.objects.insert(
                                key,
                                StoredObject {
                                    http: Some(info),
                                    body: Bytes::new(),
                                },
                            );
                        }
                    }
                }
            }
            // An incomplete VIO commits nothing.
        }
    }

    fn poll_events(&mut self) -> Vec<(ContId, CacheEvent)> {
        self.inner.borrow_mut().events.drain(..).collect()
    }
}
