//! Built-in plugins, instantiable from `plugins.register` by name.
//!
//! Three ship with the framework:
//!
//! - **`security-headers`**: stamps conservative security headers on
//!   every response.
//! - **`request-logger`**: structured request/response logging through
//!   the hook surface.
//! - **`rate-limit`**: fixed-window per-IP limiting with the bounded
//!   +1 overshoot the window design allows; over-limit requests halt
//!   the chain with a 429 payload.
//!
//! Custom plugins register through [`XyPlugin`] directly; this module is
//! only the factory for the named set.

use super::context::ExecutionContext;
use super::{
    ExecutionResult, PluginCategory, PluginPriority, PluginSpec, XyPlugin,
};
use crate::adapter::{XyRequest, XyResponse};
use crate::config::PluginRegistrationSection;
use crate::error::XyPrissError;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xypriss_net::common::duration_serde;

/// Instantiate a built-in plugin from its registration entry.
pub fn create_plugin(
    section: &PluginRegistrationSection,
) -> Result<Arc<dyn XyPlugin>, XyPrissError> {
    match section.name.as_str() {
        "security-headers" => Ok(Arc::new(SecurityHeadersPlugin::new(&section.config))),
        "request-logger" => Ok(Arc::new(RequestLoggerPlugin::new())),
        "rate-limit" => Ok(Arc::new(RateLimitPlugin::new(&section.config)?)),
        other => Err(XyPrissError::Plugin {
            message: format!("unknown built-in plugin: {other}"),
        }),
    }
}

/// Stamps security headers on every response.
pub struct SecurityHeadersPlugin {
    spec: PluginSpec,
    headers: Vec<(String, String)>,
}

impl SecurityHeadersPlugin {
    pub fn new(config: &HashMap<String, serde_json::Value>) -> Self {
        let mut headers = vec![
            ("x-content-type-options".to_string(), "nosniff".to_string()),
            (
                "x-frame-options".to_string(),
                config
                    .get("frameOptions")
                    .and_then(|v| v.as_str())
                    .unwrap_or("DENY")
                    .to_string(),
            ),
            (
                "referrer-policy".to_string(),
                "strict-origin-when-cross-origin".to_string(),
            ),
        ];
        if config.get("hsts").and_then(|v| v.as_bool()).unwrap_or(false) {
            headers.push((
                "strict-transport-security".to_string(),
                "max-age=31536000; includeSubDomains".to_string(),
            ));
        }
        Self {
            spec: PluginSpec::new("security-headers", "security-headers", "1.0.0")
                .category(PluginCategory::Security)
                .priority(PluginPriority::High),
            headers,
        }
    }
}

#[async_trait::async_trait]
impl XyPlugin for SecurityHeadersPlugin {
    fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _req: &mut XyRequest,
    ) -> Result<ExecutionResult, XyPrissError> {
        let mut result = ExecutionResult::ok();
        result.headers = self.headers.clone();
        Ok(result)
    }
}

/// Structured request/response logging through the hook surface.
pub struct RequestLoggerPlugin {
    spec: PluginSpec,
}

impl RequestLoggerPlugin {
    pub fn new() -> Self {
        Self {
            spec: PluginSpec::new("request-logger", "request-logger", "1.0.0")
                .category(PluginCategory::Custom)
                .priority(PluginPriority::Low),
        }
    }
}

impl Default for RequestLoggerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl XyPlugin for RequestLoggerPlugin {
    fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _req: &mut XyRequest,
    ) -> Result<ExecutionResult, XyPrissError> {
        Ok(ExecutionResult::ok())
    }

    async fn on_request(
        &self,
        ctx: &mut ExecutionContext,
        req: &mut XyRequest,
    ) -> Result<(), XyPrissError> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %req.method,
            path = %req.path,
            ip = %req.ip(),
            "request received"
        );
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &mut ExecutionContext,
        res: &mut XyResponse,
    ) -> Result<(), XyPrissError> {
        tracing::info!(
            request_id = %ctx.request_id,
            status = res.status_code().as_u16(),
            bytes = res.body_len(),
            elapsed_ms = ctx.timing.pipeline_start.elapsed().as_millis() as u64,
            "response ready"
        );
        Ok(())
    }

    async fn on_route_error(&self, path: &str, error: &XyPrissError) {
        tracing::warn!(path, %error, "handler failed");
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window per-IP rate limiting.
///
/// The window check runs under the per-key entry lock, so a window never
/// admits more than `max + 1` requests even under racing increments.
pub struct RateLimitPlugin {
    spec: PluginSpec,
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl RateLimitPlugin {
    pub fn new(config: &HashMap<String, serde_json::Value>) -> Result<Self, XyPrissError> {
        let max_requests = config
            .get("maxRequests")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as u32;
        let window = match config.get("window") {
            Some(serde_json::Value::String(s)) => duration_serde::parse_duration(s)
                .map_err(|e| XyPrissError::Plugin {
                    message: format!("rate-limit window: {e}"),
                })?,
            Some(serde_json::Value::Number(n)) => {
                Duration::from_secs(n.as_u64().unwrap_or(60))
            }
            None => Duration::from_secs(60),
            Some(_) => {
                return Err(XyPrissError::Plugin {
                    message: "rate-limit window must be a duration".to_string(),
                })
            }
        };
        Ok(Self {
            spec: PluginSpec::new("rate-limit", "rate-limit", "1.0.0")
                .category(PluginCategory::Security)
                .priority(PluginPriority::Critical),
            windows: DashMap::new(),
            max_requests,
            window,
        })
    }

    /// Admit or reject one request from `ip`.
    fn admit(&self, ip: &str) -> bool {
        let mut entry = self.windows.entry(ip.to_string()).or_insert_with(|| Window {
            started: Instant::now(),
            count: 0,
        });
        if entry.started.elapsed() > self.window {
            entry.started = Instant::now();
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.max_requests
    }
}

#[async_trait::async_trait]
impl XyPlugin for RateLimitPlugin {
    fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        req: &mut XyRequest,
    ) -> Result<ExecutionResult, XyPrissError> {
        let ip = req.ip();
        if self.admit(&ip) {
            Ok(ExecutionResult::ok())
        } else {
            tracing::warn!(ip = %ip, path = %req.path, "rate limit exceeded");
            Ok(ExecutionResult::halt().with_data(json!({
                "status": 429,
                "error": "Rate limit exceeded",
            })))
        }
    }
}
