//! End-to-end scenarios over the two-node harness.
//!
//! Node A initiates operations; node B serves them from its in-memory
//! cache. Caller callbacks only record; the tests drive the VCs between
//! harness runs, the way the embedding HTTP engine would.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use cachelink_engine::{CallerEvent, EngineConfig, OpArgs, VcId};
use cachelink_types::{reason, CacheKey, Digest, FragType, HttpInfo};
use cachelink_engine::cache::RemoveOptions;

use crate::harness::{Cluster, Recorder};
use crate::net::SimNetConfig;

fn digest(b: u8) -> Digest {
    Digest::from_bytes([b; 16])
}

fn http_key(b: u8) -> CacheKey {
    CacheKey::new(digest(b), FragType::Http)
}

fn generic_key(b: u8) -> CacheKey {
    CacheKey::new(digest(b), FragType::Generic)
}

fn info(len: usize) -> HttpInfo {
    HttpInfo::new(Bytes::from(vec![b'h'; len]))
}

fn body(len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(len);
    for i in 0..len {
        out.extend_from_slice(&[(i % 251) as u8]);
    }
    out.freeze()
}

fn read_http(b: u8) -> OpArgs {
    OpArgs::ReadHttp {
        key: http_key(b),
        http_request: Bytes::from_static(b"GET / HTTP/1.1"),
        lookup_config: Bytes::from_static(b"lookup"),
        hostname: Bytes::from_static(b"origin.example.com"),
        conditional: false,
        purge: false,
    }
}

fn expect_open_read(rec: &Recorder) -> (VcId, u64, Option<HttpInfo>) {
    let events = rec.drain();
    match events.into_iter().next() {
        Some(CallerEvent::OpenRead {
            vc,
            doc_size,
            http_info,
        }) => (vc, doc_size, http_info),
        other => panic!("expected OpenRead, got {other:?}"),
    }
}

/// Pulls a whole read stream through the VC, returning the bytes.
fn drain_read(cluster: &mut Cluster, rec: &Recorder, vc: VcId, now: Instant) -> Bytes {
    let mut out = BytesMut::new();
    for _ in 0..1024 {
        let mut ready = false;
        let mut eos = false;
        for ev in rec.drain() {
            match ev {
                CallerEvent::ReadReady { .. } => ready = true,
                CallerEvent::ReadEos { .. } => eos = true,
                other => panic!("unexpected event while reading: {other:?}"),
            }
        }
        if eos {
            return out.freeze();
        }
        assert!(ready, "read stalled without EOS");
        out.extend_from_slice(&cluster.a.engine.vc_take_read(vc).unwrap());
        cluster.a.engine.vc_reenable(vc).unwrap();
        cluster.run(now);
    }
    panic!("read did not complete");
}

// ======================================================================
// Scenario 1: small HTTP hit, inlined reply
// ======================================================================

#[test]
fn test_small_http_hit_inlined() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(
        EngineConfig::default().with_small_fragment_threshold(4096),
        1,
        t0,
    );
    let object = body(1800);
    cluster
        .b
        .cache
        .insert_object(http_key(0x11), Some(info(312)), object.clone());

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0x11), t0)
        .expect("op started");
    cluster.run(t0);

    let (vc, doc_size, http_info) = expect_open_read(&rec);
    assert_eq!(doc_size, 1800);
    assert_eq!(http_info, Some(info(312)));

    // One read block of 1800 bytes, then a clean EOS.
    cluster.a.engine.vc_do_io_read(vc, 1800).unwrap();
    let events = rec.drain();
    assert!(matches!(events[0], CallerEvent::ReadReady { .. }));
    let got = cluster.a.engine.vc_take_read(vc).unwrap();
    assert_eq!(got, object);
    cluster.a.engine.vc_reenable(vc).unwrap();
    assert!(matches!(rec.drain()[0], CallerEvent::ReadEos { .. }));

    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);

    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
    assert_eq!(cluster.net.open_sessions(), 0);
    assert_eq!(cluster.b.cache.open_vcs(), 0);
}

// ======================================================================
// Scenario 2: large object, windowed stream
// ======================================================================

#[test]
fn test_large_streamed_read() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 2, t0);
    cluster.b.cache.set_chunk(256 * 1024);

    let object = body(2 * 1024 * 1024);
    cluster
        .b
        .cache
        .insert_object(http_key(0x22), Some(info(312)), object.clone());

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0x22), t0)
        .unwrap();
    cluster.run(t0);

    let (vc, doc_size, _) = expect_open_read(&rec);
    assert_eq!(doc_size, 2 * 1024 * 1024);

    cluster.a.engine.vc_do_io_read(vc, doc_size).unwrap();
    cluster.run(t0);
    let got = drain_read(&mut cluster, &rec, vc, t0);
    assert_eq!(got.len(), object.len());
    assert_eq!(got, object);

    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);

    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
    assert_eq!(cluster.b.cache.open_vcs(), 0);
}

// ======================================================================
// Scenario 3: read miss salvaged into a write, resolved locally
// ======================================================================

#[test]
fn test_read_miss_write_salvage() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(
        EngineConfig::default().with_migrate_on_demand(true),
        3,
        t0,
    );

    // Nothing stored under this digest on B.
    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0x33), t0)
        .unwrap();
    cluster.run(t0);

    // The caller sees the read failure.
    let events = rec.drain();
    assert!(matches!(
        events[0],
        CallerEvent::OpenReadFailed {
            reason: reason::CACHE_NO_DOC,
            ..
        }
    ));
    // The salvaged write VC is parked on A; the open write waits on B.
    assert_eq!(cluster.a.engine.initiator_count(), 1);
    assert_eq!(cluster.b.engine.responder_count(), 1);

    // A later long open-write on A resolves locally, no new RPC.
    let writer = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            writer.callback(),
            cluster.b.id,
            OpArgs::WriteHttp {
                key: http_key(0x33),
                old_info: None,
                pin_time: 0,
                hostname: Bytes::from_static(b"origin.example.com"),
            },
            t0,
        )
        .unwrap();

    let events = writer.drain();
    let vc = match events.first() {
        Some(CallerEvent::OpenWrite { vc }) => *vc,
        other => panic!("expected OpenWrite, got {other:?}"),
    };

    // Stream 500 bytes with marshaled info, then close.
    let payload = body(500);
    cluster
        .a
        .engine
        .vc_do_io_write(vc, 500, Some(&info(200)))
        .unwrap();
    cluster.a.engine.vc_write(vc, payload.clone()).unwrap();
    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);

    // B committed the object under the digest.
    let (stored_info, stored_body) = cluster.b.cache.object(&http_key(0x33)).expect("stored");
    assert_eq!(stored_body, payload);
    assert_eq!(stored_info, Some(info(200)));

    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
    assert_eq!(cluster.b.cache.open_vcs(), 0);
}

// ======================================================================
// Scenario 4: remote write with header
// ======================================================================

#[test]
fn test_remote_write_with_header() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 4, t0);

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::WriteHttp {
                key: http_key(0x44),
                old_info: None,
                pin_time: 60,
                hostname: Bytes::from_static(b"origin.example.com"),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);

    let vc = match rec.drain().first() {
        Some(CallerEvent::OpenWrite { vc }) => *vc,
        other => panic!("expected OpenWrite, got {other:?}"),
    };

    let payload = body(500);
    cluster
        .a
        .engine
        .vc_do_io_write(vc, 500, Some(&info(200)))
        .unwrap();
    cluster.a.engine.vc_write(vc, payload.clone()).unwrap();
    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);

    let (stored_info, stored_body) = cluster.b.cache.object(&http_key(0x44)).expect("stored");
    assert_eq!(stored_body, payload);
    assert_eq!(stored_info, Some(info(200)));
    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
}

// ======================================================================
// Header-only update
// ======================================================================

#[test]
fn test_header_only_update_swaps_info() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 5, t0);
    let original = body(900);
    cluster
        .b
        .cache
        .insert_object(http_key(0x55), Some(info(100)), original.clone());

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Update {
                key: http_key(0x55),
                pin_time: 0,
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);

    let vc = match rec.drain().first() {
        Some(CallerEvent::OpenWrite { vc }) => *vc,
        other => panic!("expected OpenWrite, got {other:?}"),
    };

    cluster.a.engine.vc_header_update(vc, &info(128)).unwrap();
    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);

    // The info swapped; the body is untouched.
    let (stored_info, stored_body) = cluster.b.cache.object(&http_key(0x55)).expect("stored");
    assert_eq!(stored_info, Some(info(128)));
    assert_eq!(stored_body, original);
    assert_eq!(cluster.b.engine.responder_count(), 0);
}

// ======================================================================
// Scenario 5: timeout with late reply
// ======================================================================

#[test]
fn test_timeout_then_late_reply_dropped() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(
        EngineConfig::default().with_cluster_timeout(Duration::from_millis(100)),
        6,
        t0,
    );
    cluster
        .b
        .cache
        .insert_object(http_key(0x66), Some(info(64)), body(1000));

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0x66), t0)
        .unwrap();
    // B is unresponsive past the deadline: only A runs.
    cluster.a.engine.pump(t0 + Duration::from_millis(100));

    let events = rec.drain();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        CallerEvent::OpenReadFailed {
            reason: reason::CLUSTER_OP_TIMEOUT,
            ..
        }
    ));

    // B wakes up late and replies; A drops it without a second callback.
    let t150 = t0 + Duration::from_millis(150);
    for _ in 0..16 {
        cluster.b.engine.pump(t150);
    }
    cluster.run(t150);

    assert!(rec.is_empty());
    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
}

// ======================================================================
// Scenario 6: peer death mid-stream
// ======================================================================

#[test]
fn test_peer_death_mid_stream() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 7, t0);
    cluster.b.cache.set_chunk(256 * 1024);
    cluster
        .b
        .cache
        .insert_object(http_key(0x77), Some(info(64)), body(2 * 1024 * 1024));

    // Start the stream and pull one window.
    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0x77), t0)
        .unwrap();
    cluster.run(t0);
    let (vc, _, _) = expect_open_read(&rec);
    cluster.a.engine.vc_do_io_read(vc, 2 * 1024 * 1024).unwrap();
    cluster.run(t0);
    assert!(matches!(rec.drain()[0], CallerEvent::ReadReady { .. }));
    let first = cluster.a.engine.vc_take_read(vc).unwrap();
    assert!(!first.is_empty());

    // A second operation is still awaiting its reply.
    let pending = Recorder::new();
    cluster
        .a
        .engine
        .do_op(pending.callback(), cluster.b.id, read_http(0x78), t0)
        .unwrap();

    // B dies; the transport reports it and the membership layer fans
    // out through the registry.
    cluster.net.kill(cluster.b.id);
    cluster.a.engine.pump(t0);
    let b_id = cluster.b.id;
    cluster.a.engine.peer_died(b_id, t0);
    cluster.a.engine.pump(t0);

    let events = rec.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        CallerEvent::VcError {
            reason: reason::CLUSTER_NO_MACHINE,
            ..
        }
    )));
    let events = pending.drain();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        CallerEvent::OpenReadFailed {
            reason: reason::CLUSTER_NO_MACHINE,
            ..
        }
    ));
    assert_eq!(cluster.a.engine.initiator_count(), 0);
}

// ======================================================================
// Generic short-form read
// ======================================================================

#[test]
fn test_generic_short_read() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 8, t0);
    let object = body(2000);
    cluster
        .b
        .cache
        .insert_object(generic_key(0x88), None, object.clone());

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Read {
                key: generic_key(0x88),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);

    let (vc, doc_size, http_info) = expect_open_read(&rec);
    assert_eq!(doc_size, 2000);
    assert_eq!(http_info, None);

    cluster.a.engine.vc_do_io_read(vc, 2000).unwrap();
    let got = drain_read(&mut cluster, &rec, vc, t0);
    assert_eq!(got, object);
    cluster.a.engine.vc_do_io_close(vc, None).unwrap();
    cluster.run(t0);
}

// ======================================================================
// Remove, link, deref round trips
// ======================================================================

#[test]
fn test_remove_link_deref() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 9, t0);
    cluster
        .b
        .cache
        .insert_object(generic_key(0x91), None, body(10));

    // Link 0x92 -> 0x91.
    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Link {
                from: generic_key(0x92),
                to: generic_key(0x91),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);
    assert!(matches!(rec.drain()[0], CallerEvent::LinkDone { .. }));

    // Deref the link.
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Deref {
                key: generic_key(0x92),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);
    assert!(matches!(rec.drain()[0], CallerEvent::DerefDone { .. }));

    // Deref again: the link is gone.
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Deref {
                key: generic_key(0x92),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);
    assert!(matches!(
        rec.drain()[0],
        CallerEvent::DerefFailed {
            reason: reason::CACHE_NO_DOC,
            ..
        }
    ));

    // Remove the object.
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Remove {
                key: generic_key(0x91),
                opts: RemoveOptions::default(),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);
    assert!(matches!(rec.drain()[0], CallerEvent::RemoveDone { .. }));
    assert!(!cluster.b.cache.contains(&generic_key(0x91)));

    // Removing again fails with the cache's reason.
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::Remove {
                key: generic_key(0x91),
                opts: RemoveOptions::default(),
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);
    assert!(matches!(
        rec.drain()[0],
        CallerEvent::RemoveFailed {
            reason: reason::CACHE_NO_DOC,
            ..
        }
    ));
    assert_eq!(cluster.b.engine.responder_count(), 0);
    assert_eq!(cluster.net.open_sessions(), 0);
}

// ======================================================================
// Remote write conflict
// ======================================================================

#[test]
fn test_remote_write_conflict_fails() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(EngineConfig::default(), 10, t0);
    cluster
        .b
        .cache
        .insert_object(http_key(0xA1), Some(info(32)), body(100));

    // A non-overwriting write to an existing object is refused.
    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(
            rec.callback(),
            cluster.b.id,
            OpArgs::WriteHttp {
                key: http_key(0xA1),
                old_info: None,
                pin_time: 0,
                hostname: Bytes::new(),
            },
            t0,
        )
        .unwrap();
    cluster.run(t0);

    assert!(matches!(
        rec.drain()[0],
        CallerEvent::OpenWriteFailed {
            reason: reason::CACHE_DOC_BUSY,
            ..
        }
    ));
    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
}

// ======================================================================
// Reuse-cache purge of an unclaimed salvaged VC
// ======================================================================

#[test]
fn test_salvaged_vc_purged_after_two_scans() {
    let t0 = Instant::now();
    let mut cluster = Cluster::new(
        EngineConfig::default()
            .with_migrate_on_demand(true)
            .with_scan_interval(Duration::from_secs(10)),
        11,
        t0,
    );

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0xB1), t0)
        .unwrap();
    cluster.run(t0);
    assert_eq!(cluster.a.engine.initiator_count(), 1);

    // First scan marks, second scan purges; the parked VC and the
    // responder waiting behind it both go away.
    cluster.run(t0 + Duration::from_secs(10));
    assert_eq!(cluster.a.engine.initiator_count(), 1);
    cluster.run(t0 + Duration::from_secs(20));

    assert_eq!(cluster.a.engine.initiator_count(), 0);
    assert_eq!(cluster.b.engine.responder_count(), 0);
    assert_eq!(cluster.b.cache.open_vcs(), 0);
}

// ======================================================================
// Loss without retransmit stalls rather than corrupts
// ======================================================================

#[test]
fn test_lossy_network_stalls_cleanly() {
    let t0 = Instant::now();
    let mut cluster = Cluster::with_net_config(
        EngineConfig::default(),
        SimNetConfig::lossy(1.0),
        12,
        t0,
    );
    cluster.b.cache.set_chunk(64 * 1024);
    cluster
        .b
        .cache
        .insert_object(http_key(0xC1), Some(info(16)), body(256 * 1024));

    let rec = Recorder::new();
    cluster
        .a
        .engine
        .do_op(rec.callback(), cluster.b.id, read_http(0xC1), t0)
        .unwrap();
    cluster.run(t0);

    // The open still succeeds (replies are not data frames)...
    let (vc, _, _) = expect_open_read(&rec);
    cluster.a.engine.vc_do_io_read(vc, 256 * 1024).unwrap();
    cluster.run(t0);

    // ...but every data frame is lost: no delivery, no corruption, no
    // spurious completion.
    assert!(rec.is_empty());
    assert!(cluster.net.dropped() > 0);
}
