//! # Framework Error Types
//!
//! This module defines the error surface for the whole framework,
//! providing standardized error types and the HTTP response mapping
//! every rejection goes through.
//!
//! ## Overview
//!
//! The error system provides:
//!
//! - **One enum**: every failure the pipeline can surface to a client
//!   is an [`XyPrissError`] variant
//! - **Stable codes**: each layer decorates its failures with a machine
//!   code ([`XyPrissError::code`]), part of the public contract and
//!   stable across versions
//! - **The wire envelope**: the `IntoResponse` implementation maps each
//!   variant to its HTTP status and the stable JSON body
//! - **Security opacity**: blocked clients receive one shared public
//!   code regardless of which classifier fired, so responses cannot be
//!   used to fingerprint the chain
//!
//! ## Error Categories
//!
//! - **Request-scoped**: `NotFound`, `RequestTimeout`, `Security`,
//!   `RateLimit`, `Overloaded`. All surface as 4xx responses and are
//!   recoverable.
//! - **Upstream**: `Proxy` and `UpstreamTimeout`, mapping the network
//!   substrate's failures to 502/504.
//! - **Plugin-scoped**: `Plugin` and `PluginCycle`; cycles are fatal at
//!   boot, execution failures are isolated by the engine.
//! - **Configuration**: `Config` and `ImmutableConfig`, including the
//!   loud rejection of writes into sealed subtrees.
//! - **Internal**: `Session`, `Internal`, `Serialization`, `Io`; these
//!   never leak details to clients.
//!
//! ## HTTP Status Code Mapping
//!
//! - **403 Forbidden**: security-chain rejections
//! - **404 Not Found**: no matching route
//! - **408 Request Timeout**: the request deadline elapsed
//! - **429 Too Many Requests**: rate-limit violations
//! - **502 / 504**: upstream failures and upstream timeouts
//! - **503 Service Unavailable**: the concurrency cap rejected
//! - **500 Internal Server Error**: everything that must stay generic
//!
//! ## The Wire Envelope
//!
//! ```json
//! { "error": "Access denied",
//!   "code": "NEHONIXYPBROw01",
//!   "timestamp": "2026-02-22T10:00:00Z" }
//! ```
//!
//! Production responses never expose classifier internals. When the
//! security chain runs with its debug flag set, blocked responses carry
//! an additional `xypriss` object with the originating module, the
//! inner code, structured details, and a User-Agent snippet.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::error::XyPrissError;
//!
//! fn lookup(id: &str) -> Result<String, XyPrissError> {
//!     if id.is_empty() {
//!         return Err(XyPrissError::NotFound {
//!             method: "GET".to_string(),
//!             path: "/items/".to_string(),
//!         });
//!     }
//!     Ok(format!("item {id}"))
//! }
//!
//! // Handlers return Result<XyResponse, XyPrissError>; the pipeline
//! // converts any error into the envelope automatically.
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use xypriss_net::NetError;

/// Public code attached to every security rejection, regardless of the
/// classifier that produced it. Blocked clients cannot distinguish
/// classifiers from one another.
pub const PUBLIC_SECURITY_CODE: &str = "NEHONIXYPBROw01";

/// Details of a security-chain rejection.
///
/// `debug` is decided by the chain at block time (from
/// `security.debug`); the envelope only carries internals when it is set.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityBlock {
    /// Originating classifier, e.g. `browser_only` or `injection.sql`
    pub module: &'static str,
    /// Inner code, e.g. `AUTOMATION_TOOL_DETECTED`
    pub code: String,
    /// Structured details (score breakdowns, matched patterns)
    pub details: Option<serde_json::Value>,
    /// First bytes of the offending User-Agent
    pub ua_snippet: Option<String>,
    /// Whether debug details may be emitted
    pub debug: bool,
}

/// All failures the framework can produce.
#[derive(Error, Debug)]
pub enum XyPrissError {
    /// Configuration loading or validation failures
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A write attempted to change a sealed configuration subtree
    #[error("immutable configuration path '{path}' cannot be changed")]
    ImmutableConfig { path: String },

    /// Plugin registration or execution failures
    #[error("plugin error: {message}")]
    Plugin { message: String },

    /// The plugin dependency graph contains a cycle
    #[error("plugin dependency cycle: {}", cycle.join(" -> "))]
    PluginCycle { cycle: Vec<String> },

    /// No route matched the request
    #[error("route not found: {method} {path}")]
    NotFound { method: String, path: String },

    /// The request exceeded its processing deadline
    #[error("request timed out")]
    RequestTimeout,

    /// An upstream did not answer within the proxy deadline
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// The security chain rejected the request
    #[error("access denied")]
    Security(SecurityBlock),

    /// A request- or token-rate limit was exceeded
    #[error("rate limit exceeded: {message}")]
    RateLimit { message: String },

    /// The concurrency cap rejected the request
    #[error("server overloaded")]
    Overloaded,

    /// Session store failures (missing secret, crypto errors)
    #[error("session error: {message}")]
    Session { message: String },

    /// Reverse-proxy failures from the network substrate
    #[error("proxy error: {0}")]
    Proxy(#[from] NetError),

    /// Anything that should never reach a client in detail
    #[error("internal server error: {message}")]
    Internal { message: String },

    /// JSON serialization and deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (push material reads, config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl XyPrissError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            XyPrissError::Config { .. } => "XYP_CONFIG",
            XyPrissError::ImmutableConfig { .. } => "XYP_CONFIG_IMMUTABLE",
            XyPrissError::Plugin { .. } => "XYP_PLUGIN",
            XyPrissError::PluginCycle { .. } => "XYP_PLUGIN_CYCLE",
            XyPrissError::NotFound { .. } => "XYP_NOT_FOUND",
            XyPrissError::RequestTimeout => "XYP_REQUEST_TIMEOUT",
            XyPrissError::UpstreamTimeout => "XYP_UPSTREAM_TIMEOUT",
            XyPrissError::Security(_) => PUBLIC_SECURITY_CODE,
            XyPrissError::RateLimit { .. } => "XYP_RATE_LIMIT",
            XyPrissError::Overloaded => "XYP_OVERLOADED",
            XyPrissError::Session { .. } => "XYP_SESSION",
            XyPrissError::Proxy(_) => "XYP_PROXY",
            XyPrissError::Internal { .. } => "XYP_INTERNAL",
            XyPrissError::Serialization(_) => "XYP_SERIALIZATION",
            XyPrissError::Io(_) => "XYP_IO",
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            XyPrissError::NotFound { .. } => StatusCode::NOT_FOUND,
            XyPrissError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            XyPrissError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            XyPrissError::Security(_) => StatusCode::FORBIDDEN,
            XyPrissError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            XyPrissError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            XyPrissError::Proxy(inner) => match inner {
                NetError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            XyPrissError::Config { .. }
            | XyPrissError::ImmutableConfig { .. }
            | XyPrissError::Plugin { .. }
            | XyPrissError::PluginCycle { .. }
            | XyPrissError::Session { .. }
            | XyPrissError::Internal { .. }
            | XyPrissError::Serialization(_)
            | XyPrissError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Production responses stay generic for
    /// anything that could leak internals.
    fn public_message(&self) -> String {
        match self {
            XyPrissError::Security(_) => "Access denied".to_string(),
            XyPrissError::NotFound { method, path } => format!("Not found: {method} {path}"),
            XyPrissError::RequestTimeout => "Request timed out".to_string(),
            XyPrissError::UpstreamTimeout => "Upstream timed out".to_string(),
            XyPrissError::RateLimit { message } => message.clone(),
            XyPrissError::Overloaded => "Server overloaded, try again later".to_string(),
            XyPrissError::Proxy(_) => "Bad gateway".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for XyPrissError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.public_message(),
            "code": self.code(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let XyPrissError::Security(block) = &self {
            if block.debug {
                body["xypriss"] = json!({
                    "module": block.module,
                    "code": block.code,
                    "details": block.details,
                    "userAgent": block.ua_snippet,
                });
            }
        }

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(debug: bool) -> XyPrissError {
        XyPrissError::Security(SecurityBlock {
            module: "browser_only",
            code: "AUTOMATION_TOOL_DETECTED".to_string(),
            details: Some(json!({"signal": "user-agent"})),
            ua_snippet: Some("curl/8.0".to_string()),
            debug,
        })
    }

    #[test]
    fn security_errors_share_the_public_code() {
        assert_eq!(block(false).code(), PUBLIC_SECURITY_CODE);
        assert_eq!(block(true).code(), PUBLIC_SECURITY_CODE);
    }

    #[test]
    fn statuses_follow_the_error_kind() {
        assert_eq!(block(false).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            XyPrissError::RequestTimeout.status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            XyPrissError::Proxy(NetError::NoHealthyUpstreams).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            XyPrissError::Proxy(NetError::UpstreamTimeout {
                key: "a:1".into(),
                timeout_ms: 5
            })
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            XyPrissError::PluginCycle { cycle: vec![] }.code(),
            "XYP_PLUGIN_CYCLE"
        );
        assert_eq!(XyPrissError::Overloaded.code(), "XYP_OVERLOADED");
    }
}
