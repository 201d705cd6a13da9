//! # XyPriss Network Substrate
//!
//! Reusable networking building blocks consumed by the XyPriss framework:
//!
//! - **Upstream pool**: registration and health/usage bookkeeping for
//!   reverse-proxy backends, identified by `host:port`.
//! - **Load balancer**: round-robin, least-connections, ip-hash, and
//!   weighted-round-robin target selection over the healthy subset.
//! - **Health checker**: periodic active probes that flip upstream health
//!   and are monotonically reflected into balancer decisions.
//! - **Proxy forwarder**: request forwarding with header injection,
//!   bounded retries across distinct upstreams, and per-upstream stats.
//! - **Circuit breaker**: a windowed Closed/Open/Half-Open state machine
//!   shared by the proxy and the framework's plugin engine.
//!
//! The crate deliberately has no opinion about the serving side; the
//! framework crate owns request/response adaptation and decides when to
//! route a request through the forwarder.
//!
//! ## Example
//!
//! ```rust
//! use xypriss_net::{Upstream, UpstreamPool, LoadBalancer, BalanceStrategy};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(UpstreamPool::new(vec![
//!     Upstream::new("10.0.0.10", 8080),
//!     Upstream::new("10.0.0.11", 8080).with_weight(2),
//! ]));
//! let balancer = LoadBalancer::new(BalanceStrategy::IpHash);
//! let target = balancer.select(&pool.healthy_snapshot(), Some("203.0.113.7"));
//! ```

pub mod balancer;
pub mod circuit_breaker;
pub mod common;
pub mod error;
pub mod health;
pub mod proxy;
pub mod upstream;

pub use balancer::{BalanceStrategy, LoadBalancer};
pub use circuit_breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use error::NetError;
pub use health::{HealthCheckConfig, HealthChecker};
pub use proxy::{ForwardRequest, ForwardResponse, ProxyConfig, ProxyForwarder};
pub use upstream::{Upstream, UpstreamPool, UpstreamState};
