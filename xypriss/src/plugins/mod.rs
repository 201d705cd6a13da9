//! # Plugin System
//!
//! Plugins extend the pipeline with middleware, lifecycle hooks, and a
//! hot-path `execute` stage. The system is built around three pieces:
//!
//! - **[`XyPlugin`]**: the trait a plugin implements. Every hook has a
//!   default no-op body; a plugin overrides only what it needs. Identity,
//!   classification, priority, dependencies, and execution limits live in
//!   the plugin's [`PluginSpec`].
//! - **[`registry::PluginRegistry`]**: owns the plugin set and the total
//!   execution order: dependencies first (topological), priority within
//!   dependency layers, registration order as the final tie-break.
//!   Registration after boot integrates the plugin immediately.
//! - **[`engine::PluginEngine`]**: the per-request executor with pooled
//!   execution contexts, per-plugin circuit breakers, result caching for
//!   cacheable plugins, and deadline enforcement.
//!
//! Plugin failures are isolated. A throwing or overrunning plugin opens
//! its own breaker and the request continues, unless the plugin is
//! critical-priority and explicitly signals an abort.

pub mod builtin;
pub mod context;
pub mod engine;
pub mod registry;

use crate::adapter::{XyRequest, XyResponse};
use crate::error::XyPrissError;
use context::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use xypriss_net::BreakerConfig;

/// Plugin classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Security,
    Performance,
    Cache,
    Network,
    Custom,
}

/// Scheduling priority. Within one dependency layer, critical plugins run
/// before high, high before normal, normal before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl PluginPriority {
    pub fn rank(&self) -> u8 {
        match self {
            PluginPriority::Critical => 0,
            PluginPriority::High => 1,
            PluginPriority::Normal => 2,
            PluginPriority::Low => 3,
        }
    }
}

/// Bucket a plugin's middleware contribution lands in. Buckets are applied
/// first → normal → last; plugin execution order applies within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewareBucket {
    First,
    Normal,
    Last,
}

/// Request fields a cacheable plugin declares as its fingerprint inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheField {
    Method,
    Path,
    Query,
    Header(String),
}

/// Static description of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique id across the registry
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: PluginCategory,
    pub priority: PluginPriority,
    /// Declared async; synchronous plugins still run on the task but are
    /// scheduled eagerly
    pub is_async: bool,
    /// Whether `execute` results may be cached by fingerprint
    pub cacheable: bool,
    /// Fingerprint inputs for cacheable plugins
    pub cache_fields: Vec<CacheField>,
    /// Budget for one `execute` call; zero means no budget
    pub max_execution_time: Duration,
    /// Plugin ids that must execute before this one
    pub dependencies: Vec<String>,
    pub middleware_bucket: MiddlewareBucket,
    /// Per-plugin breaker tuning; `None` uses the engine default
    pub breaker: Option<BreakerConfig>,
}

impl PluginSpec {
    /// Minimal spec with sensible defaults.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category: PluginCategory::Custom,
            priority: PluginPriority::Normal,
            is_async: true,
            cacheable: false,
            cache_fields: Vec::new(),
            max_execution_time: Duration::from_millis(100),
            dependencies: Vec::new(),
            middleware_bucket: MiddlewareBucket::Normal,
            breaker: None,
        }
    }

    pub fn category(mut self, category: PluginCategory) -> Self {
        self.category = category;
        self
    }

    pub fn priority(mut self, priority: PluginPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn bucket(mut self, bucket: MiddlewareBucket) -> Self {
        self.middleware_bucket = bucket;
        self
    }

    pub fn cacheable(mut self, fields: Vec<CacheField>) -> Self {
        self.cacheable = true;
        self.cache_fields = fields;
        self
    }

    pub fn execution_budget(mut self, budget: Duration) -> Self {
        self.max_execution_time = budget;
        self
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_time_ms: u64,
    /// `false` aborts the remaining chain
    pub should_continue: bool,
    pub data: Option<serde_json::Value>,
    /// Headers to add to the response
    pub headers: Vec<(String, String)>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            should_continue: true,
            ..Default::default()
        }
    }

    pub fn halt() -> Self {
        Self {
            success: true,
            should_continue: false,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            should_continue: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The lifecycle hooks a permission entry may allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    OnRegister,
    OnServerStart,
    OnServerReady,
    OnRequest,
    OnResponse,
    OnError,
    OnSecurityAttack,
    OnRequestTiming,
    OnPerformanceMetrics,
    OnRateLimit,
    OnRouteError,
    OnServerStop,
    Execute,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::OnRegister => "onRegister",
            HookKind::OnServerStart => "onServerStart",
            HookKind::OnServerReady => "onServerReady",
            HookKind::OnRequest => "onRequest",
            HookKind::OnResponse => "onResponse",
            HookKind::OnError => "onError",
            HookKind::OnSecurityAttack => "onSecurityAttack",
            HookKind::OnRequestTiming => "onRequestTiming",
            HookKind::OnPerformanceMetrics => "onPerformanceMetrics",
            HookKind::OnRateLimit => "onRateLimit",
            HookKind::OnRouteError => "onRouteError",
            HookKind::OnServerStop => "onServerStop",
            HookKind::Execute => "execute",
        }
    }
}

/// Severity attached to security attack reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Payload delivered to `on_security_attack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackData {
    pub attack_type: String,
    pub severity: Severity,
    pub path: String,
    pub ip: String,
    pub blocked: bool,
}

/// Control flow returned by middleware contributions.
pub enum MiddlewareFlow {
    Continue,
    /// Short-circuit with this response
    Halt(Box<XyResponse>),
}

/// Future type of a middleware invocation; borrows the request and
/// context for the duration of the call.
pub type MiddlewareFuture<'a> =
    Pin<Box<dyn Future<Output = Result<MiddlewareFlow, XyPrissError>> + Send + 'a>>;

/// One middleware contribution.
pub type MiddlewareFn = Arc<
    dyn for<'a> Fn(&'a mut XyRequest, &'a mut ExecutionContext) -> MiddlewareFuture<'a>
        + Send
        + Sync,
>;

/// The plugin contract. Hooks default to no-ops; `spec` and `execute`
/// are the only members a plugin must provide.
#[async_trait::async_trait]
pub trait XyPlugin: Send + Sync {
    fn spec(&self) -> &PluginSpec;

    /// Hot-path stage, run once per request in registry order.
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        req: &mut XyRequest,
    ) -> Result<ExecutionResult, XyPrissError>;

    /// Ordered middleware contributed to this plugin's bucket.
    fn middleware(&self) -> Vec<MiddlewareFn> {
        Vec::new()
    }

    async fn on_register(&self, _config: &serde_json::Value) -> Result<(), XyPrissError> {
        Ok(())
    }

    async fn on_server_start(&self) -> Result<(), XyPrissError> {
        Ok(())
    }

    async fn on_server_ready(&self) -> Result<(), XyPrissError> {
        Ok(())
    }

    async fn on_request(
        &self,
        _ctx: &mut ExecutionContext,
        _req: &mut XyRequest,
    ) -> Result<(), XyPrissError> {
        Ok(())
    }

    async fn on_response(
        &self,
        _ctx: &mut ExecutionContext,
        _res: &mut XyResponse,
    ) -> Result<(), XyPrissError> {
        Ok(())
    }

    /// Invoked when a user handler fails. Return `true` after writing a
    /// response to stop the error chain.
    async fn on_error(
        &self,
        _ctx: &mut ExecutionContext,
        _error: &XyPrissError,
        _res: &mut XyResponse,
    ) -> Result<bool, XyPrissError> {
        Ok(false)
    }

    async fn on_security_attack(&self, _attack: &AttackData) {}

    async fn on_request_timing(&self, _path: &str, _elapsed: Duration) {}

    async fn on_performance_metrics(&self, _snapshot: &serde_json::Value) {}

    async fn on_rate_limit(&self, _ip: &str, _path: &str) {}

    async fn on_route_error(&self, _path: &str, _error: &XyPrissError) {}

    async fn on_server_stop(&self) -> Result<(), XyPrissError> {
        Ok(())
    }
}
