//! Windowed circuit breaker.
//!
//! Protects a failure-prone stage (an upstream, or one plugin in the
//! framework's pipeline) by short-circuiting calls once failures
//! accumulate. The state machine:
//!
//! - **Closed**: calls pass; failures inside the rolling window are
//!   counted, and reaching the threshold opens the circuit.
//! - **Open**: calls are rejected until the cooldown elapses, then the
//!   breaker moves to half-open.
//! - **Half-Open**: a bounded number of trial calls is admitted; one
//!   success closes the circuit, one failure re-opens it.
//!
//! Failures older than the window no longer count toward the threshold,
//! so a slow trickle of errors does not open the circuit the way a burst
//! does. Callers either wrap work in [`CircuitBreaker::call`] or, when
//! they manage their own deadlines, gate on [`CircuitBreaker::try_acquire`]
//! and report with `record_success` / `record_failure`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::common::duration_serde;

/// Rejections produced by the breaker itself.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The circuit is open; the protected stage is not called at all
    #[error("circuit breaker is open")]
    Open,
    /// The protected call exceeded the breaker's own deadline
    #[error("circuit breaker call timed out")]
    Timeout,
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-breaker tuning. Each plugin and upstream may carry its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// Rolling window that failures are counted in
    #[serde(with = "duration_serde")]
    pub failure_window: Duration,
    /// Cooldown before an open circuit admits trial calls
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
    /// Deadline applied by [`CircuitBreaker::call`]; zero disables it
    #[serde(with = "duration_serde")]
    pub call_timeout: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Timestamps of failures still inside the window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_calls: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn prune_window(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The breaker. Cheap to clone via `Arc`; all transitions are logged.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Arc<RwLock<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(RwLock::new(BreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` under the breaker, applying the configured call
    /// deadline when one is set.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.try_acquire().await {
            return Err(BreakerError::Open);
        }

        let outcome = if self.config.call_timeout.is_zero() {
            Ok(operation().await)
        } else {
            tokio::time::timeout(self.config.call_timeout, operation()).await
        };

        match outcome {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(error)) => {
                tracing::debug!(breaker = %self.name, %error, "protected call failed");
                self.record_failure().await;
                Err(BreakerError::Open)
            }
            Err(_) => {
                self.record_failure().await;
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Whether a call may proceed right now. Transitions open → half-open
    /// when the cooldown has elapsed and meters half-open trial calls.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    tracing::info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.total_successes += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.failures.clear();
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.half_open_calls = 0;
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "circuit closed");
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.total_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.failures.push_back(Instant::now());
                inner.prune_window(self.config.failure_window);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_calls = 0;
                tracing::warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    /// Snapshot for health reports.
    pub async fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.read().await;
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            windowed_failures: inner.failures.len() as u32,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    /// Force open; used by operators and tests.
    pub async fn force_open(&self) {
        let mut inner = self.inner.write().await;
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Reset to a pristine closed state.
    pub async fn force_closed(&self) {
        let mut inner = self.inner.write().await;
        *inner = BreakerInner::new();
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub windowed_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}
