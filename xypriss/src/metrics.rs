//! Request metrics and the health endpoint contract.
//!
//! A bounded window of per-request records backs the aggregate view:
//! throughput, average latency, and error rate. The health report
//! follows the collaborator contract, with `status` degrading to
//! `degraded` and `unhealthy` as error rate and latency climb, and a
//! metrics object carrying `responseTime`, `errorRate`, `throughput`,
//! and `connections`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WINDOW_CAPACITY: usize = 2048;

#[derive(Debug, Clone)]
struct RequestRecord {
    status: u16,
    latency: Duration,
    at: Instant,
}

/// Aggregated view over the rolling window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub requests_total: u64,
    pub requests_per_second: f64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}

/// Health report served at `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub metrics: HealthMetrics,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub response_time: f64,
    pub error_rate: f64,
    pub throughput: f64,
    pub connections: usize,
}

/// Per-worker metrics recorder.
pub struct MetricsRecorder {
    total: AtomicU64,
    errors: AtomicU64,
    window: Mutex<VecDeque<RequestRecord>>,
    started: Instant,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            started: Instant::now(),
        }
    }

    pub fn record(&self, status: u16, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = self.window.lock();
        if window.len() >= WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(RequestRecord {
            status,
            latency,
            at: Instant::now(),
        });
    }

    pub fn aggregated(&self) -> AggregatedMetrics {
        let window = self.window.lock();
        let recent: Vec<&RequestRecord> = window
            .iter()
            .filter(|r| r.at.elapsed() < Duration::from_secs(60))
            .collect();

        let (latency_sum, error_count) = recent.iter().fold(
            (Duration::ZERO, 0u64),
            |(latency, errors), record| {
                (
                    latency + record.latency,
                    errors + u64::from(record.status >= 500),
                )
            },
        );

        let count = recent.len();
        AggregatedMetrics {
            requests_total: self.total.load(Ordering::Relaxed),
            requests_per_second: count as f64 / 60.0,
            average_latency_ms: if count == 0 {
                0.0
            } else {
                latency_sum.as_millis() as f64 / count as f64
            },
            error_rate: if count == 0 {
                0.0
            } else {
                error_count as f64 / count as f64
            },
        }
    }

    /// The `/health` answer. `connections` comes from the connection
    /// pool, which the caller owns.
    pub fn health(&self, connections: usize) -> HealthReport {
        let aggregated = self.aggregated();
        let status = if aggregated.error_rate > 0.5 {
            "unhealthy"
        } else if aggregated.error_rate > 0.1 || aggregated.average_latency_ms > 1_000.0 {
            "degraded"
        } else {
            "healthy"
        };
        HealthReport {
            status,
            metrics: HealthMetrics {
                response_time: aggregated.average_latency_ms,
                error_rate: aggregated.error_rate,
                throughput: aggregated.requests_per_second,
                connections,
            },
            last_check: Utc::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
