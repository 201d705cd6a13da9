//! Active upstream health checking.
//!
//! A background loop probes every registered upstream on a fixed interval
//! with a bounded GET. A 2xx or 3xx answer within the deadline marks the
//! upstream healthy; anything else (including timeouts and connection
//! refusals) marks it unhealthy. The pool flips health atomically per key,
//! so a balancer snapshot taken after `check_all` returns can never select
//! an upstream that round observed down.

use crate::common::duration_serde;
use crate::upstream::UpstreamPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the active health-check loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe cadence
    #[serde(with = "duration_serde", default = "default_interval")]
    pub interval: Duration,
    /// Path probed on each upstream
    #[serde(default = "default_path")]
    pub path: String,
    /// Per-probe deadline
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Scheme used for probe URLs
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            path: default_path(),
            timeout: default_timeout(),
            scheme: default_scheme(),
        }
    }
}

/// Periodic prober that drives upstream health in the pool.
pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
    config: HealthCheckConfig,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, config: HealthCheckConfig) -> Self {
        // Redirects are classified, not followed: a 3xx from the backend
        // already proves liveness.
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            pool,
            config,
            client,
        }
    }

    /// Spawn the background loop. The task runs until the handle is
    /// aborted; the first round fires immediately so a freshly booted
    /// proxy does not wait a full interval to learn about dead backends.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                self.check_all().await;
            }
        })
    }

    /// Probe every registered upstream once, concurrently.
    pub async fn check_all(&self) {
        let states = self.pool.all();
        let probes = states.iter().map(|state| {
            let key = state.key();
            let url = format!(
                "{}{}",
                state.upstream.base_url(&self.config.scheme),
                self.config.path
            );
            let client = self.client.clone();
            async move {
                let healthy = match client.get(&url).send().await {
                    Ok(response) => {
                        let status = response.status();
                        status.is_success() || status.is_redirection()
                    }
                    Err(error) => {
                        tracing::debug!(upstream = %key, %error, "health probe failed");
                        false
                    }
                };
                (key, healthy)
            }
        });

        for (key, healthy) in futures::future::join_all(probes).await {
            self.pool.set_health(&key, healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Upstream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn checker_for(server: &MockServer) -> (Arc<UpstreamPool>, HealthChecker) {
        let address = server.address();
        let pool = Arc::new(UpstreamPool::new(vec![Upstream::new(
            address.ip().to_string(),
            address.port(),
        )]));
        let config = HealthCheckConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let checker = HealthChecker::new(Arc::clone(&pool), config);
        (pool, checker)
    }

    #[tokio::test]
    async fn healthy_probe_keeps_upstream_in_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (pool, checker) = checker_for(&server).await;
        checker.check_all().await;
        assert_eq!(pool.healthy_count(), 1);
    }

    #[tokio::test]
    async fn failing_probe_removes_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (pool, checker) = checker_for(&server).await;
        checker.check_all().await;
        assert_eq!(pool.healthy_count(), 0);
    }

    #[tokio::test]
    async fn redirect_counts_as_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(302))
            .mount(&server)
            .await;

        let (pool, checker) = checker_for(&server).await;
        checker.check_all().await;
        assert_eq!(pool.healthy_count(), 1);
    }
}
