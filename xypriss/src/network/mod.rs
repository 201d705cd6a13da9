//! # Network Pipeline
//!
//! The serving-side optimizations of the framework:
//!
//! - [`connection`]: per-remote-endpoint connection records, keep-alive
//!   header policy, idle eviction, and pool statistics.
//! - [`compression`]: content-encoding negotiation under a strict
//!   algorithm allow-list, plus the codec glue.
//! - [`push`]: the HTTP/2 server-push decision engine with candidate
//!   computation, validator and client-hint checks, and per-asset-class
//!   cache metadata.

pub mod compression;
pub mod connection;
pub mod push;

pub use compression::{Algorithm, CompressionPolicy};
pub use connection::{ConnectionManager, ConnectionTouch};
pub use push::{PushCandidate, PushPlanner, Pusher};
