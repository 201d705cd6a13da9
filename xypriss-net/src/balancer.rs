//! Load-balancing strategies over the healthy upstream subset.
//!
//! The balancer never consults the pool itself: callers pass the healthy
//! snapshot for the current request, which keeps health transitions
//! monotonic with respect to selection (a snapshot taken after a check
//! completed can never contain an upstream that check observed unhealthy).
//!
//! Strategies:
//!
//! - `round-robin`: atomic cursor modulo the healthy count.
//! - `least-connections`: lowest in-flight usage count wins; ties go to
//!   the earlier-registered upstream.
//! - `ip-hash`: SHA-256 of the client IP, first 32 bits, modulo the
//!   healthy count. The same client maps to the same upstream for as long
//!   as the healthy set is unchanged, and returns to it when it recovers.
//! - `weighted-round-robin`: cumulative random selection over weights;
//!   weight 0 excludes an upstream.

use crate::upstream::UpstreamState;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Target-selection strategy for the reverse proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
    /// Cycle through healthy upstreams in registration order
    RoundRobin,
    /// Pick the upstream with the fewest in-flight requests
    LeastConnections,
    /// Stable client-to-upstream affinity derived from the client IP
    IpHash,
    /// Random selection proportional to configured weights
    WeightedRoundRobin,
}

impl Default for BalanceStrategy {
    fn default() -> Self {
        BalanceStrategy::RoundRobin
    }
}

/// Stateless selection logic plus the round-robin cursor.
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Select a target from the healthy snapshot for this request.
    ///
    /// Returns `None` when the snapshot is empty; the caller answers 502
    /// immediately rather than waiting for recovery.
    pub fn select(
        &self,
        healthy: &[Arc<UpstreamState>],
        client_ip: Option<&str>,
    ) -> Option<Arc<UpstreamState>> {
        if healthy.is_empty() {
            return None;
        }
        match self.strategy {
            BalanceStrategy::RoundRobin => self.select_round_robin(healthy),
            BalanceStrategy::LeastConnections => Self::select_least_connections(healthy),
            BalanceStrategy::IpHash => Self::select_ip_hash(healthy, client_ip),
            BalanceStrategy::WeightedRoundRobin => self.select_weighted(healthy),
        }
    }

    fn select_round_robin(&self, healthy: &[Arc<UpstreamState>]) -> Option<Arc<UpstreamState>> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(&healthy[index]))
    }

    fn select_least_connections(healthy: &[Arc<UpstreamState>]) -> Option<Arc<UpstreamState>> {
        healthy
            .iter()
            .min_by_key(|s| s.active_requests())
            .cloned()
    }

    fn select_ip_hash(
        healthy: &[Arc<UpstreamState>],
        client_ip: Option<&str>,
    ) -> Option<Arc<UpstreamState>> {
        let ip = client_ip.unwrap_or("");
        let index = (ip_hash_bits(ip) as usize) % healthy.len();
        Some(Arc::clone(&healthy[index]))
    }

    fn select_weighted(&self, healthy: &[Arc<UpstreamState>]) -> Option<Arc<UpstreamState>> {
        let total: u64 = healthy.iter().map(|s| s.upstream.weight as u64).sum();
        if total == 0 {
            // Every weight is zero; fall back to the cursor so the pool
            // still serves rather than starving.
            return self.select_round_robin(healthy);
        }
        let mut roll = rand::thread_rng().gen_range(0..total);
        for state in healthy {
            let weight = state.upstream.weight as u64;
            if weight == 0 {
                continue;
            }
            if roll < weight {
                return Some(Arc::clone(state));
            }
            roll -= weight;
        }
        healthy.last().cloned()
    }
}

/// First 32 bits (big-endian) of SHA-256 over the client IP.
fn ip_hash_bits(ip: &str) -> u32 {
    let digest = Sha256::digest(ip.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{Upstream, UpstreamPool};

    fn pool_of(n: u16) -> UpstreamPool {
        UpstreamPool::new((0..n).map(|i| Upstream::new("up", 8000 + i)).collect())
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let pool = pool_of(3);
        let balancer = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let healthy = pool.healthy_snapshot();
        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select(&healthy, None).unwrap().key())
            .collect();
        assert_eq!(
            picks,
            vec!["up:8000", "up:8001", "up:8002", "up:8000", "up:8001", "up:8002"]
        );
    }

    #[test]
    fn least_connections_prefers_idle() {
        let pool = pool_of(2);
        let busy = pool.get("up:8000").unwrap();
        let _guard = busy.begin_request();
        let balancer = LoadBalancer::new(BalanceStrategy::LeastConnections);
        let selected = balancer.select(&pool.healthy_snapshot(), None).unwrap();
        assert_eq!(selected.key(), "up:8001");
    }

    #[test]
    fn ip_hash_is_sticky_per_client() {
        let pool = pool_of(3);
        let balancer = LoadBalancer::new(BalanceStrategy::IpHash);
        let healthy = pool.healthy_snapshot();
        let first = balancer.select(&healthy, Some("10.0.0.1")).unwrap().key();
        for _ in 0..100 {
            let pick = balancer.select(&healthy, Some("10.0.0.1")).unwrap().key();
            assert_eq!(pick, first);
        }
    }

    #[test]
    fn weighted_excludes_zero_weight() {
        let pool = UpstreamPool::new(vec![
            Upstream::new("a", 80).with_weight(0),
            Upstream::new("b", 80).with_weight(5),
        ]);
        let balancer = LoadBalancer::new(BalanceStrategy::WeightedRoundRobin);
        let healthy = pool.healthy_snapshot();
        for _ in 0..50 {
            let pick = balancer.select(&healthy, None).unwrap();
            assert_eq!(pick.key(), "b:80");
        }
    }

    #[test]
    fn empty_snapshot_selects_nothing() {
        let balancer = LoadBalancer::new(BalanceStrategy::RoundRobin);
        assert!(balancer.select(&[], None).is_none());
    }
}
