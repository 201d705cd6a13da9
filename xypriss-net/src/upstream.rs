//! Upstream registration and per-upstream bookkeeping.
//!
//! An [`Upstream`] is a backend identified by `host:port` with an optional
//! selection weight. The [`UpstreamPool`] owns one [`UpstreamState`] per
//! registered upstream and is the single place where health flips and usage
//! counters are recorded. Readers always operate on a snapshot of the
//! healthy subset so balancer decisions never observe a half-applied health
//! transition.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn default_weight() -> u32 {
    1
}

/// A reverse-proxy backend, identified by `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    /// Relative selection weight for weighted strategies. Weight 0 excludes
    /// the upstream from weighted selection without deregistering it.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Canonical pool key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL used for forwarding and health probes.
    pub fn base_url(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Live state for a registered upstream.
///
/// `healthy` is mutated only by the health-check loop (and test hooks);
/// `active` tracks in-flight forwarded requests and doubles as the usage
/// count consulted by least-connections selection.
#[derive(Debug)]
pub struct UpstreamState {
    pub upstream: Upstream,
    healthy: AtomicBool,
    active: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    avg_latency_ms: Mutex<f64>,
    last_check: Mutex<Option<Instant>>,
}

impl UpstreamState {
    fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            healthy: AtomicBool::new(true),
            active: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(0.0),
            last_check: Mutex::new(None),
        }
    }

    pub fn key(&self) -> String {
        self.upstream.key()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn active_requests(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn average_latency_ms(&self) -> f64 {
        *self.avg_latency_ms.lock()
    }

    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        *self.last_check.lock() = Some(Instant::now());
        previous != healthy
    }

    /// Mark the start of a forwarded request. The returned guard releases
    /// the slot on drop so cancellation cannot leak usage counts.
    pub fn begin_request(self: &Arc<Self>) -> UsageGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        UsageGuard {
            state: Arc::clone(self),
        }
    }

    /// Fold one completed request into the running stats.
    pub fn record_result(&self, success: bool, latency_ms: u64) {
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        // Exponential moving average keeps the hot path allocation-free.
        let alpha = 0.1;
        let mut avg = self.avg_latency_ms.lock();
        *avg = alpha * latency_ms as f64 + (1.0 - alpha) * *avg;
    }
}

/// RAII guard for the in-flight request count of one upstream.
pub struct UsageGuard {
    state: Arc<UpstreamState>,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The set of registered upstreams.
///
/// Registration is expected at boot (and occasionally at runtime via the
/// admin surface); reads vastly outnumber writes, so the vector sits behind
/// a read lock. Snapshots preserve registration order; the balancer's
/// deterministic strategies depend on that order being stable.
pub struct UpstreamPool {
    states: RwLock<Vec<Arc<UpstreamState>>>,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        let pool = Self {
            states: RwLock::new(Vec::new()),
        };
        for upstream in upstreams {
            pool.register(upstream);
        }
        pool
    }

    /// Register an upstream. Duplicate keys are logged and ignored.
    pub fn register(&self, upstream: Upstream) {
        let key = upstream.key();
        let mut states = self.states.write();
        if states.iter().any(|s| s.key() == key) {
            tracing::warn!(upstream = %key, "upstream already registered, ignoring");
            return;
        }
        tracing::debug!(upstream = %key, weight = upstream.weight, "upstream registered");
        states.push(Arc::new(UpstreamState::new(upstream)));
    }

    /// Snapshot of every registered upstream, registration order.
    pub fn all(&self) -> Vec<Arc<UpstreamState>> {
        self.states.read().clone()
    }

    /// Snapshot of the healthy subset, registration order.
    pub fn healthy_snapshot(&self) -> Vec<Arc<UpstreamState>> {
        self.states
            .read()
            .iter()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<Arc<UpstreamState>> {
        self.states.read().iter().find(|s| s.key() == key).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.states.read().iter().filter(|s| s.is_healthy()).count()
    }

    /// Flip health for one upstream; returns whether the flag changed.
    /// Only the health-check loop and tests call this.
    pub fn set_health(&self, key: &str, healthy: bool) -> bool {
        match self.get(key) {
            Some(state) => {
                let changed = state.set_healthy(healthy);
                if changed {
                    if healthy {
                        tracing::info!(upstream = %key, "upstream recovered");
                    } else {
                        tracing::warn!(upstream = %key, "upstream marked unhealthy");
                    }
                }
                changed
            }
            None => false,
        }
    }
}
