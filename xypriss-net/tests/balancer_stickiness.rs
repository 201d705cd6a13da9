//! Load-balancer behavior across health transitions.

use std::sync::Arc;
use xypriss_net::{BalanceStrategy, LoadBalancer, Upstream, UpstreamPool};

fn three_upstream_pool() -> Arc<UpstreamPool> {
    Arc::new(UpstreamPool::new(vec![
        Upstream::new("backend-a", 9001),
        Upstream::new("backend-b", 9002),
        Upstream::new("backend-c", 9003),
    ]))
}

#[test]
fn ip_hash_stickiness_survives_upstream_churn() {
    let pool = three_upstream_pool();
    let balancer = LoadBalancer::new(BalanceStrategy::IpHash);

    // Every request from one client lands on the same upstream.
    let home = balancer
        .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
        .unwrap()
        .key();
    for _ in 0..1000 {
        let pick = balancer
            .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
            .unwrap()
            .key();
        assert_eq!(pick, home);
    }

    // Take the home upstream down: the client is deterministically
    // re-mapped onto one of the two survivors.
    pool.set_health(&home, false);
    let fallback = balancer
        .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
        .unwrap()
        .key();
    assert_ne!(fallback, home);
    for _ in 0..100 {
        let pick = balancer
            .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
            .unwrap()
            .key();
        assert_eq!(pick, fallback);
    }

    // Restore it: the client routes straight back to its original home.
    pool.set_health(&home, true);
    for _ in 0..1000 {
        let pick = balancer
            .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
            .unwrap()
            .key();
        assert_eq!(pick, home);
    }
}

#[test]
fn ip_hash_spreads_distinct_clients() {
    let pool = three_upstream_pool();
    let balancer = LoadBalancer::new(BalanceStrategy::IpHash);
    let healthy = pool.healthy_snapshot();

    let mut seen = std::collections::HashSet::new();
    for i in 0..64 {
        let ip = format!("10.1.2.{i}");
        seen.insert(balancer.select(&healthy, Some(&ip)).unwrap().key());
    }
    // 64 distinct clients over 3 upstreams should touch more than one.
    assert!(seen.len() > 1);
}

#[test]
fn no_selection_with_zero_healthy_upstreams() {
    let pool = three_upstream_pool();
    for state in pool.all() {
        pool.set_health(&state.key(), false);
    }
    let balancer = LoadBalancer::new(BalanceStrategy::RoundRobin);
    assert!(balancer
        .select(&pool.healthy_snapshot(), Some("10.0.0.1"))
        .is_none());
}
