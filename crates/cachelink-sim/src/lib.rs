//! # cachelink-sim: deterministic simulation for `cachelink`
//!
//! Test tooling for the cluster cache engine:
//! - [`SimNet`]: simulated session transport with mask-gated pull
//!   delivery, priority bypass, seeded loss injection, and peer-death
//! - [`MemCache`]: in-memory cache backend with windowed VIO progress
//! - [`Cluster`]: a two-node harness stepping both engines with an
//!   explicit clock
//!
//! Every run is a pure function of the seed and the call sequence: the
//! only randomness is the net's loss-injection draw, and that comes
//! from a generator the seed fixes. A failing scenario replays exactly.
//!
//! The end-to-end scenario tests for the RPC engine live here, next to
//! the harness that drives them.

mod harness;
mod memcache;
mod net;

#[cfg(test)]
mod tests;

pub use harness::{Cluster, Node, Recorder};
pub use memcache::MemCache;
pub use net::{NetHandle, SimNet, SimNetConfig};
