//! Request forwarding to selected upstreams.
//!
//! The forwarder owns the retry loop: select a target from the healthy
//! snapshot, forward with a deadline, and on a transport failure exclude
//! that upstream and re-select with the same strategy until the bounded
//! retry budget is spent. Header hygiene (hop-by-hop stripping, the
//! `X-Forwarded-*` / `X-Request-ID` injection upstream and
//! `X-Proxied-By` / `X-Upstream` injection downstream) happens here so the
//! framework only deals in adapted requests.

use crate::balancer::LoadBalancer;
use crate::common::duration_serde;
use crate::error::NetError;
use crate::upstream::{UpstreamPool, UpstreamState};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Headers that must not travel between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Additional attempts after the first failure, each against a
    /// different upstream
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Per-attempt forwarding deadline
    #[serde(with = "duration_serde", default = "default_forward_timeout")]
    pub timeout: Duration,
    /// Scheme used to reach upstreams
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_retries() -> u32 {
    2
}

fn default_forward_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            timeout: default_forward_timeout(),
            scheme: default_scheme(),
        }
    }
}

/// One request to be forwarded, already adapted by the framework.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query string, e.g. `/api/items?page=2`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub request_id: String,
}

/// The upstream's answer, with downstream proxy headers already applied.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub upstream_key: String,
    pub latency_ms: u64,
}

/// Forwarder combining the pool, the balancer, and the retry loop.
pub struct ProxyForwarder {
    pool: Arc<UpstreamPool>,
    balancer: LoadBalancer,
    config: ProxyConfig,
    client: reqwest::Client,
}

impl ProxyForwarder {
    pub fn new(pool: Arc<UpstreamPool>, balancer: LoadBalancer, config: ProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            pool,
            balancer,
            config,
            client,
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Forward one request, retrying across distinct upstreams.
    ///
    /// With zero healthy upstreams this fails immediately; callers map
    /// [`NetError::NoHealthyUpstreams`] and [`NetError::RetriesExhausted`]
    /// to 502.
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, NetError> {
        let attempts = self.config.retries.saturating_add(1);
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error = NetError::NoHealthyUpstreams;

        for attempt in 0..attempts {
            let healthy: Vec<Arc<UpstreamState>> = self
                .pool
                .healthy_snapshot()
                .into_iter()
                .filter(|s| !excluded.contains(&s.key()))
                .collect();

            let target = match self.balancer.select(&healthy, Some(&request.client_ip)) {
                Some(target) => target,
                None => {
                    return if excluded.is_empty() {
                        Err(NetError::NoHealthyUpstreams)
                    } else {
                        Err(NetError::RetriesExhausted {
                            attempts: attempt + 1,
                        })
                    };
                }
            };

            let key = target.key();
            match self.forward_to(&target, &request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::warn!(
                        upstream = %key,
                        attempt = attempt + 1,
                        %error,
                        "forward attempt failed"
                    );
                    excluded.insert(key);
                    last_error = error;
                }
            }
        }

        if last_error.is_retryable() {
            Err(NetError::RetriesExhausted { attempts })
        } else {
            Err(last_error)
        }
    }

    async fn forward_to(
        &self,
        target: &Arc<UpstreamState>,
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, NetError> {
        let key = target.key();
        let url = format!(
            "{}{}",
            target.upstream.base_url(&self.config.scheme),
            request.path_and_query
        );

        let mut headers = strip_hop_by_hop(&request.headers);
        headers.insert("x-forwarded-by", HeaderValue::from_static("xypriss"));
        if let Ok(value) = HeaderValue::from_str(&request.request_id) {
            headers.insert("x-request-id", value);
        }
        append_forwarded_for(&mut headers, &request.client_ip);

        let guard = target.begin_request();
        let started = Instant::now();
        let outcome = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        drop(guard);

        match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                let mut response_headers = strip_hop_by_hop(response.headers());
                response_headers.insert("x-proxied-by", HeaderValue::from_static("xypriss"));
                if let Ok(value) = HeaderValue::from_str(&key) {
                    response_headers.insert("x-upstream", value);
                }
                let body = response.bytes().await.map_err(|e| {
                    target.record_result(false, latency_ms);
                    NetError::UpstreamFailed {
                        key: key.clone(),
                        message: e.to_string(),
                    }
                })?;
                target.record_result(true, latency_ms);
                Ok(ForwardResponse {
                    status,
                    headers: response_headers,
                    body,
                    upstream_key: key,
                    latency_ms,
                })
            }
            Err(error) => {
                target.record_result(false, latency_ms);
                if error.is_timeout() {
                    Err(NetError::UpstreamTimeout {
                        key,
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    })
                } else {
                    Err(NetError::UpstreamFailed {
                        key,
                        message: error.to_string(),
                    })
                }
            }
        }
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let name = HeaderName::from_static("x-forwarded-for");
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(name, value);
    }
}
