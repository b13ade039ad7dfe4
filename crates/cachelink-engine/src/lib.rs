//! # cachelink-engine: cluster cache RPC state machines
//!
//! This crate implements the core of `cachelink`: a node receives a
//! content-addressed cache request whose object lives on a peer, ships
//! it across a session-oriented cluster transport, streams the object
//! (or write payload) between the two nodes, and surfaces a local
//! virtual connection the HTTP engine drives as if the cache were
//! local.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         ClusterCache                          │
//! │  ┌────────────┐  ┌────────────┐  ┌─────────────────────────┐  │
//! │  │ Initiator  │  │ Responder  │  │ Shared tables           │  │
//! │  │ records    │  │ records    │  │  sequence registry      │  │
//! │  │ (do_op)    │  │ (cache_op) │  │  write-VC reuse cache   │  │
//! │  └─────┬──────┘  └─────┬──────┘  │  sequence generator     │  │
//! │        │               │         └─────────────────────────┘  │
//! │  ┌─────┴───────────────┴──────┐  ┌─────────────────────────┐  │
//! │  │ SessionTransport (seam)    │  │ CacheBackend (seam)     │  │
//! │  └────────────────────────────┘  └─────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! One engine instance runs per event thread; the striped registries
//! are shared process-wide. Everything is driven by an explicit pump
//! with a caller-supplied clock, which keeps the state machines
//! deterministic under test.

pub mod cache;
mod config;
mod engine;
mod error;
mod initiator;
pub mod metrics;
mod responder;
mod seqreg;
mod stream;
mod timing;
pub mod transport;
mod vccache;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use engine::{
    CallerEvent, ClusterCache, OpAction, OpArgs, OpCallback, OpId, SharedTables, VcId,
};
pub use error::{EngineError, EngineResult};
pub use seqreg::{RegOutcome, SequenceRegistry, Take, REGISTRY_BUCKETS};
pub use stream::StreamFlow;
pub use vccache::{Insert, Lookup, Sweep, WriteVcCache, VC_CACHE_BUCKETS};
