//! Error types for the network substrate.
//!
//! Every failure observed while talking to an upstream is mapped into
//! [`NetError`]; the framework crate decorates these with its own response
//! codes when they surface to a client. Variants carry the upstream key
//! wherever one is known so that logs and health reports can attribute
//! failures without extra lookups.

use thiserror::Error;

/// Errors produced by upstream selection, forwarding, and health checking.
#[derive(Error, Debug)]
pub enum NetError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No healthy upstream is available for selection
    #[error("no healthy upstreams available")]
    NoHealthyUpstreams,

    /// An upstream did not answer within its forwarding deadline
    #[error("upstream {key} timed out after {timeout_ms}ms")]
    UpstreamTimeout { key: String, timeout_ms: u64 },

    /// An upstream refused or dropped the connection, or answered with a
    /// transport-level failure
    #[error("upstream {key} failed: {message}")]
    UpstreamFailed { key: String, message: String },

    /// All retry attempts were consumed without a successful forward
    #[error("upstream retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A health probe could not be executed (probe errors never flip
    /// health by themselves; they count as a failed check)
    #[error("health check failed for {key}: {message}")]
    HealthCheck { key: String, message: String },

    /// An upstream definition was rejected at registration time
    #[error("invalid upstream: {message}")]
    InvalidUpstream { message: String },

    /// The circuit protecting this target is open
    #[error("circuit open for {name}")]
    CircuitOpen { name: String },

    /// JSON serialization and deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetError {
    /// Whether a retry against a *different* upstream may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::UpstreamTimeout { .. }
                | NetError::UpstreamFailed { .. }
                | NetError::Http(_)
        )
    }

    /// Stable machine-readable code for this error layer.
    pub fn code(&self) -> &'static str {
        match self {
            NetError::Http(_) => "NET_HTTP",
            NetError::NoHealthyUpstreams => "NET_NO_UPSTREAM",
            NetError::UpstreamTimeout { .. } => "NET_UPSTREAM_TIMEOUT",
            NetError::UpstreamFailed { .. } => "NET_UPSTREAM_FAILED",
            NetError::RetriesExhausted { .. } => "NET_RETRIES_EXHAUSTED",
            NetError::HealthCheck { .. } => "NET_HEALTH_CHECK",
            NetError::InvalidUpstream { .. } => "NET_INVALID_UPSTREAM",
            NetError::CircuitOpen { .. } => "NET_CIRCUIT_OPEN",
            NetError::Serialization(_) => "NET_SERIALIZATION",
        }
    }
}
