//! # Configuration Management
//!
//! This module provides configuration for the whole framework: loading,
//! validation, environment overrides, and runtime updates with
//! deep-merge semantics.
//!
//! ## Overview
//!
//! Two layers cooperate here:
//!
//! 1. **Typed sections** ([`XyPrissConfig`] and friends): the validated
//!    serde view loaded from TOML with `XYPRISS_*` environment overrides.
//!    Every component receives the handle it needs through its
//!    constructor; nothing load-bearing reads a global.
//! 2. **The merge tree** ([`ConfigManager`]): a process-wide JSON view of
//!    the same data with deep-merge update semantics. Objects merge
//!    recursively, arrays concatenate, and a subtree carrying
//!    `__isXyPrissImmutable: true` is sealed: any update that would change
//!    a value inside it fails loudly. Updates re-derive the typed view and
//!    fan out a change event on a broadcast channel.
//!
//! ## Configuration Structure
//!
//! The root [`XyPrissConfig`] record carries one section per concern:
//!
//! - **`server`**: bind address, auto-port-switch, trust-proxy, the
//!   connection pool, compression, and HTTP/2 push
//! - **`cluster`**: worker count, autoscaling, heartbeats, graceful
//!   shutdown
//! - **`cache`**: the plugin result cache
//! - **`requestManagement`**: timeouts (with per-route overrides) and
//!   concurrency caps
//! - **`security`**: one sub-record per classifier and detector, plus
//!   the route include/exclude lists
//! - **`plugins`**: built-in plugin registrations, the hook allow-list,
//!   and context-pool sizing
//! - **`proxy`**: reverse-proxy routes and the health-check loop
//! - **`multiServer`**: additional listeners as sub-config overrides
//! - **`logging`**: level, per-component overrides, suppress patterns
//! - **`xems`**: the encrypted session store
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::config::{ConfigManager, XyPrissConfig};
//! use serde_json::json;
//!
//! // Load, override from the environment, validate; all in one step.
//! let config = XyPrissConfig::load("xypriss.toml")?;
//!
//! // Wrap it for runtime updates and change notifications.
//! let manager = ConfigManager::new(config)?;
//! let mut changes = manager.subscribe();
//!
//! manager.update(json!({"server": {"port": 9090}}))?;
//! assert_eq!(manager.typed().server.port, 9090);
//! ```
//!
//! ## Environment Variables
//!
//! Recognized overrides, applied after the file is parsed:
//!
//! - `XYPRISS_HOST`: override `server.host`
//! - `XYPRISS_PORT`: override `server.port`
//! - `XYPRISS_LOG_LEVEL`: override `logging.level`
//! - `XYPRISS_WORKERS`: override `cluster.workers` (`auto` or a number)
//! - `XYPRISS_XEMS_SECRET`: override `xems.secret`
//!
//! ## Configuration File Example
//!
//! ```toml
//! [server]
//! port = 8080
//! host = "0.0.0.0"
//! trustProxy = true
//!
//! [server.autoPortSwitch]
//! enabled = true
//! maxAttempts = 10
//!
//! [server.compression]
//! enabled = true
//! algorithms = ["br", "gzip"]
//! threshold = 1024
//!
//! [cluster]
//! enabled = true
//! workers = "auto"
//!
//! [cluster.autoScale]
//! enabled = true
//! min = 2
//! max = 6
//! cpuThreshold = 80.0
//!
//! [security.browserOnly]
//! enabled = true
//! threshold = 3.0
//!
//! [xems]
//! enabled = true
//! secret = "<64 hex chars>"
//! defaultTtl = "15m"
//! ```
//!
//! Key names are camelCase on the wire (the file and the merge tree);
//! the Rust structs stay snake_case via serde renames.

use crate::error::XyPrissError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use xypriss_net::common::duration_serde;
use xypriss_net::health::HealthCheckConfig;
use xypriss_net::upstream::Upstream;
use xypriss_net::BalanceStrategy;

/// Reserved key that seals a configuration subtree against change.
pub const IMMUTABLE_FLAG: &str = "__isXyPrissImmutable";

/// Root configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct XyPrissConfig {
    pub server: ServerSection,
    pub cluster: ClusterSection,
    pub cache: CacheSection,
    pub request_management: RequestManagementSection,
    pub security: SecuritySection,
    pub plugins: PluginsSection,
    pub proxy: ProxySection,
    pub multi_server: MultiServerSection,
    pub logging: LoggingSection,
    pub xems: XemsSection,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub auto_port_switch: AutoPortSwitchSection,
    /// Honor `X-Forwarded-For` when deriving the client IP
    pub trust_proxy: bool,
    pub connection: ConnectionSection,
    pub compression: CompressionSection,
    pub push: PushSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            auto_port_switch: AutoPortSwitchSection::default(),
            trust_proxy: false,
            connection: ConnectionSection::default(),
            compression: CompressionSection::default(),
            push: PushSection::default(),
        }
    }
}

/// Fallback port probing when the configured port is taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoPortSwitchSection {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Inclusive range probed by the `range` strategy
    pub port_range: Option<(u16, u16)>,
    pub strategy: PortSwitchStrategy,
}

impl Default for AutoPortSwitchSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            port_range: None,
            strategy: PortSwitchStrategy::Increment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSwitchStrategy {
    /// Try port, port+1, port+2, ...
    Increment,
    /// Probe random ports inside `portRange`
    Random,
}

/// Connection-pool policy for the connection plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionSection {
    pub keep_alive: bool,
    #[serde(with = "duration_serde")]
    pub keep_alive_timeout: Duration,
    pub max_connections: usize,
    #[serde(with = "duration_serde")]
    pub max_idle_time: Duration,
    pub max_requests_per_connection: u64,
    /// Advertise HTTP/2 via Alt-Svc on HTTP/1.1 responses
    pub http2_hints: bool,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(75),
            max_connections: 10_000,
            max_idle_time: Duration::from_secs(300),
            max_requests_per_connection: 1_000,
            http2_hints: false,
            request_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Response-compression policy. `algorithms` is a strict allow-list: a
/// coding absent here is never used even when the client accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionSection {
    pub enabled: bool,
    pub algorithms: Vec<String>,
    /// Bodies of at most this many bytes stay uncompressed
    pub threshold: usize,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithms: vec!["br".to_string(), "gzip".to_string(), "deflate".to_string()],
            threshold: 1024,
        }
    }
}

/// HTTP/2 server-push decision engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushSection {
    pub enabled: bool,
    /// Directory push candidates are resolved against
    pub root_dir: Option<String>,
}

/// Cluster supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSection {
    pub enabled: bool,
    pub workers: WorkerCount,
    pub auto_scale: AutoScaleSection,
    pub graceful_shutdown: GracefulShutdownSection,
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: WorkerCount::Auto,
            auto_scale: AutoScaleSection::default(),
            graceful_shutdown: GracefulShutdownSection::default(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
        }
    }
}

/// `"auto"` resolves to the CPU core count at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    Auto,
    Fixed(usize),
}

impl Serialize for WorkerCount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkerCount::Auto => serializer.serialize_str("auto"),
            WorkerCount::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match Value::deserialize(deserializer)? {
            Value::String(s) if s == "auto" => Ok(WorkerCount::Auto),
            Value::Number(n) => n
                .as_u64()
                .map(|n| WorkerCount::Fixed(n as usize))
                .ok_or_else(|| Error::custom("worker count must be positive")),
            other => Err(Error::custom(format!(
                "workers must be \"auto\" or a number, got {other}"
            ))),
        }
    }
}

impl WorkerCount {
    pub fn resolve(&self) -> usize {
        match self {
            WorkerCount::Auto => num_cpus::get(),
            WorkerCount::Fixed(n) => (*n).max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoScaleSection {
    pub enabled: bool,
    pub min: usize,
    pub max: usize,
    /// Percent of aggregate CPU that triggers scale-up
    pub cpu_threshold: f64,
    /// Percent of memory that triggers the same rules
    pub memory_threshold: f64,
    #[serde(with = "duration_serde")]
    pub scale_interval: Duration,
}

impl Default for AutoScaleSection {
    fn default() -> Self {
        Self {
            enabled: false,
            min: 2,
            max: 8,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            scale_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GracefulShutdownSection {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for GracefulShutdownSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Plugin result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSection {
    pub enabled: bool,
    pub max_entries: usize,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Request timeouts and concurrency limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestManagementSection {
    pub timeouts: TimeoutsSection,
    pub concurrency: ConcurrencySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutsSection {
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,
    /// Per-route overrides, longest matching prefix wins
    #[serde(deserialize_with = "route_timeouts", serialize_with = "route_timeouts_ser")]
    pub routes: HashMap<String, Duration>,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            routes: HashMap::new(),
        }
    }
}

fn route_timeouts<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (route, value) in raw {
        let duration = match value {
            Value::String(s) => duration_serde::parse_duration(&s).map_err(Error::custom)?,
            Value::Number(n) => Duration::from_secs(
                n.as_u64()
                    .ok_or_else(|| Error::custom("route timeout must be positive"))?,
            ),
            _ => return Err(Error::custom("invalid route timeout")),
        };
        out.insert(route, duration);
    }
    Ok(out)
}

fn route_timeouts_ser<S>(
    routes: &HashMap<String, Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(routes.len()))?;
    for (route, duration) in routes {
        map.serialize_entry(route, &format!("{}s", duration.as_secs()))?;
    }
    map.end()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencySection {
    pub max_concurrent_requests: Option<usize>,
    pub max_per_ip: Option<usize>,
}

/// Security chain settings; one sub-record per classifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecuritySection {
    /// Emit classifier internals in blocked responses
    pub debug: bool,
    pub browser_only: ClassifierSection,
    pub terminal_only: ClassifierSection,
    pub mobile_only: ClassifierSection,
    pub sql_injection: DetectorSection,
    pub path_traversal: DetectorSection,
    pub command_injection: DetectorSection,
    pub xxe: DetectorSection,
    pub ldap_injection: DetectorSection,
    pub route_config: RouteConfigSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassifierSection {
    pub enabled: bool,
    /// Minimum score on the scored path (browser-only)
    pub threshold: f64,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorSection {
    pub enabled: bool,
    pub block_on_detection: bool,
    /// Contextual score below this is treated as a false positive
    pub false_positive_threshold: f64,
    pub contextual_analysis: bool,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            block_on_detection: true,
            false_positive_threshold: 1.0,
            contextual_analysis: true,
        }
    }
}

/// Route include/exclude lists applied to every classifier and detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfigSection {
    /// When non-empty, only matching routes are inspected
    pub include: Vec<String>,
    /// Matching routes are never inspected
    pub exclude: Vec<String>,
}

/// Plugin system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginsSection {
    pub register: Vec<PluginRegistrationSection>,
    pub plugin_permissions: Vec<PluginPermissionSection>,
    pub context_pool_size: usize,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            register: Vec::new(),
            plugin_permissions: Vec::new(),
            context_pool_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginRegistrationSection {
    pub name: String,
    pub enabled: bool,
    pub config: HashMap<String, Value>,
}

impl Default for PluginRegistrationSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            config: HashMap::new(),
        }
    }
}

/// Per-plugin hook allow-list; a plugin without an entry may use every hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginPermissionSection {
    pub name: String,
    pub allowed_hooks: Vec<String>,
}

/// Reverse-proxy routes and the health-check loop feeding them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySection {
    pub enabled: bool,
    pub routes: Vec<ProxyRouteSection>,
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyRouteSection {
    /// Requests whose path starts with this prefix are proxied
    pub prefix: String,
    pub upstreams: Vec<Upstream>,
    pub strategy: BalanceStrategy,
    pub retries: u32,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ProxyRouteSection {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            upstreams: Vec::new(),
            strategy: BalanceStrategy::RoundRobin,
            retries: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Additional listeners, each a self-contained sub-config produced by
/// deep-merging `overrides` into the base tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiServerSection {
    pub enabled: bool,
    pub servers: Vec<MultiServerEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MultiServerEntry {
    pub name: String,
    /// Sub-config fragment merged over the base configuration
    pub overrides: Value,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSection {
    pub level: String,
    /// Per-component level overrides, `component -> level`
    pub components: HashMap<String, String>,
    /// Log targets silenced entirely
    pub suppress_patterns: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            components: HashMap::new(),
            suppress_patterns: Vec::new(),
        }
    }
}

/// XEMS encrypted session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct XemsSection {
    pub enabled: bool,
    /// 32-byte secret, hex- or base64-encoded. Required when enabled.
    pub secret: Option<String>,
    #[serde(with = "duration_serde")]
    pub default_ttl: Duration,
    /// Rotate the token on every resolve
    pub auto_rotation: bool,
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
    pub cookie_name: String,
    pub header_name: String,
    /// Request field sessions are attached to
    pub attach_to: String,
    /// Sandbox the HTTP binding resolves against
    pub sandbox: String,
    #[serde(with = "duration_serde")]
    pub max_retention: Duration,
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for XemsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            default_ttl: Duration::from_secs(15 * 60),
            auto_rotation: true,
            grace_period: Duration::from_secs(1),
            cookie_name: "xems_token".to_string(),
            header_name: "x-xypriss-token".to_string(),
            attach_to: "session".to_string(),
            sandbox: "web".to_string(),
            max_retention: Duration::from_secs(5 * 24 * 3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl XyPrissConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable, fails to parse,
    /// an override is malformed, or validation rejects a value. All of
    /// these are fatal at boot.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use xypriss::config::XyPrissConfig;
    ///
    /// let config = XyPrissConfig::load("xypriss.toml")?;
    /// config.validate()?;
    /// ```
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: XyPrissConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides recognized at boot.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("XYPRISS_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("XYPRISS_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("XYPRISS_PORT is not a valid port: {port}"))?;
        }
        if let Ok(level) = std::env::var("XYPRISS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(workers) = std::env::var("XYPRISS_WORKERS") {
            self.cluster.workers = if workers == "auto" {
                WorkerCount::Auto
            } else {
                WorkerCount::Fixed(workers.parse().map_err(|_| {
                    anyhow::anyhow!("XYPRISS_WORKERS must be 'auto' or a number: {workers}")
                })?)
            };
        }
        if let Ok(secret) = std::env::var("XYPRISS_XEMS_SECRET") {
            self.xems.secret = Some(secret);
        }
        Ok(())
    }

    /// Boot-time validation; failures here are fatal and name the key.
    ///
    /// Checked constraints include a non-empty host, a non-zero port
    /// and connection cap, known compression algorithm names, coherent
    /// autoscale bounds, a decodable 32-byte XEMS secret whenever XEMS
    /// is enabled, and well-formed proxy routes.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server.host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server.port must be between 1 and 65535");
        }
        if self.server.connection.max_connections == 0 {
            anyhow::bail!("server.connection.maxConnections cannot be 0");
        }
        for algorithm in &self.server.compression.algorithms {
            if !matches!(algorithm.as_str(), "br" | "gzip" | "deflate") {
                anyhow::bail!(
                    "server.compression.algorithms contains unknown algorithm '{algorithm}'"
                );
            }
        }
        if self.cluster.auto_scale.enabled {
            let scale = &self.cluster.auto_scale;
            if scale.min == 0 || scale.min > scale.max {
                anyhow::bail!("cluster.autoScale requires 0 < min <= max");
            }
            if !(0.0..=100.0).contains(&scale.cpu_threshold) {
                anyhow::bail!("cluster.autoScale.cpuThreshold must be within 0..=100");
            }
        }
        if self.xems.enabled {
            let secret = self
                .xems
                .secret
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("xems.secret is required when xems.enabled"))?;
            decode_secret(secret)
                .map_err(|e| anyhow::anyhow!("xems.secret is invalid: {e}"))?;
        }
        for route in &self.proxy.routes {
            if route.prefix.is_empty() {
                anyhow::bail!("proxy.routes entries require a non-empty prefix");
            }
            if self.proxy.enabled && route.upstreams.is_empty() {
                anyhow::bail!(
                    "proxy route '{}' has no upstreams configured",
                    route.prefix
                );
            }
        }
        Ok(())
    }
}

/// Decode a configured XEMS secret into exactly 32 key bytes.
///
/// Accepts 64 hex characters or standard base64 of 32 bytes; anything
/// else is rejected with a reason suitable for the fatal boot log.
pub fn decode_secret(secret: &str) -> Result<[u8; 32], String> {
    use base64::Engine;
    let bytes = if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
        (0..32)
            .map(|i| u8::from_str_radix(&secret[i * 2..i * 2 + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| e.to_string())?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| format!("not hex or base64: {e}"))?
    };
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("secret must decode to 32 bytes, got {len}"))
}

/// Change notification emitted after every successful `update`.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Dotted paths touched by the update
    pub paths: Vec<String>,
}

struct ManagerInner {
    tree: parking_lot::RwLock<Value>,
    typed: parking_lot::RwLock<Arc<XyPrissConfig>>,
    events: broadcast::Sender<ConfigChange>,
}

/// Process-wide configuration handle with deep-merge update semantics.
///
/// Cloning is cheap; all clones observe the same tree. Components hold
/// a clone and read the typed view per request; operators (and the
/// admin surface) read the raw tree.
///
/// # Examples
///
/// ```rust
/// use xypriss::config::{ConfigManager, XyPrissConfig};
/// use serde_json::json;
///
/// let manager = ConfigManager::new(XyPrissConfig::default())?;
/// manager.update(json!({"logging": {"level": "debug"}}))?;
/// assert_eq!(manager.typed().logging.level, "debug");
/// ```
#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ManagerInner>,
}

impl ConfigManager {
    pub fn new(config: XyPrissConfig) -> Result<Self, XyPrissError> {
        let tree = serde_json::to_value(&config)?;
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                tree: parking_lot::RwLock::new(tree),
                typed: parking_lot::RwLock::new(Arc::new(config)),
                events,
            }),
        })
    }

    /// Current typed view.
    pub fn typed(&self) -> Arc<XyPrissConfig> {
        self.inner.typed.read().clone()
    }

    /// Snapshot of the merge tree.
    pub fn tree(&self) -> Value {
        self.inner.tree.read().clone()
    }

    /// Value at a dotted path, if present.
    pub fn get_path(&self, dotted: &str) -> Option<Value> {
        let tree = self.inner.tree.read();
        let mut current = &*tree;
        for segment in dotted.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Deep-merge `delta` into the tree.
    ///
    /// Objects merge recursively and arrays concatenate. A subtree sealed
    /// with [`IMMUTABLE_FLAG`] rejects any write that would change a value;
    /// writing the identical value back is permitted. On success the typed
    /// view is re-derived and subscribers are notified.
    ///
    /// # Arguments
    ///
    /// * `delta` - A JSON fragment merged over the current tree
    ///
    /// # Errors
    ///
    /// Fails with [`XyPrissError::ImmutableConfig`] naming the sealed
    /// path, leaving the tree completely unchanged (no partial apply),
    /// or with a serialization error when the merged tree no longer
    /// deserializes into the typed sections.
    ///
    /// # Examples
    ///
    /// ```rust
    /// manager.update(json!({
    ///     "logging": {"suppressPatterns": ["hyper"]},
    /// }))?;
    /// // Arrays concatenate, so repeated updates keep appending.
    /// ```
    pub fn update(&self, delta: Value) -> Result<(), XyPrissError> {
        let mut tree = self.inner.tree.write();
        let mut next = tree.clone();
        deep_merge(&mut next, &delta, "")?;

        let typed: XyPrissConfig = serde_json::from_value(strip_flags(next.clone()))?;
        *tree = next;
        *self.inner.typed.write() = Arc::new(typed);
        drop(tree);

        let paths = top_level_paths(&delta);
        let _ = self.inner.events.send(ConfigChange { paths });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.inner.events.subscribe()
    }
}

/// Merge `delta` into `base` per the framework's rules.
///
/// - Objects merge recursively
/// - Arrays concatenate (additive semantics)
/// - Scalars replace
/// - A subtree whose object carries [`IMMUTABLE_FLAG`] set to `true`
///   rejects any write that would change an existing value and any new
///   key, transitively through its children
///
/// # Arguments
///
/// * `base` - The tree being updated in place
/// * `delta` - The fragment merged over it
/// * `path` - Dotted path prefix used in error messages; pass `""` at
///   the root
pub fn deep_merge(base: &mut Value, delta: &Value, path: &str) -> Result<(), XyPrissError> {
    match (base, delta) {
        (Value::Object(base_map), Value::Object(delta_map)) => {
            let sealed = base_map
                .get(IMMUTABLE_FLAG)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            for (key, delta_value) in delta_map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match base_map.get_mut(key) {
                    Some(base_value) => {
                        if sealed && base_value != delta_value {
                            // A sealed object also seals everything below it.
                            if !matches!(
                                (&*base_value, delta_value),
                                (Value::Object(_), Value::Object(_))
                            ) {
                                return Err(XyPrissError::ImmutableConfig { path: child_path });
                            }
                        }
                        deep_merge_sealed(base_value, delta_value, &child_path, sealed)?;
                    }
                    None => {
                        if sealed {
                            return Err(XyPrissError::ImmutableConfig { path: child_path });
                        }
                        base_map.insert(key.clone(), delta_value.clone());
                    }
                }
            }
            Ok(())
        }
        (Value::Array(base_array), Value::Array(delta_array)) => {
            base_array.extend(delta_array.iter().cloned());
            Ok(())
        }
        (base_slot, delta_value) => {
            *base_slot = delta_value.clone();
            Ok(())
        }
    }
}

fn deep_merge_sealed(
    base: &mut Value,
    delta: &Value,
    path: &str,
    inherited_seal: bool,
) -> Result<(), XyPrissError> {
    if inherited_seal {
        match (&mut *base, delta) {
            (Value::Object(base_map), Value::Object(delta_map)) => {
                for (key, delta_value) in delta_map {
                    let child_path = format!("{path}.{key}");
                    match base_map.get_mut(key) {
                        Some(base_value) => {
                            deep_merge_sealed(base_value, delta_value, &child_path, true)?
                        }
                        None => return Err(XyPrissError::ImmutableConfig { path: child_path }),
                    }
                }
                Ok(())
            }
            (base_value, delta_value) => {
                if *base_value != *delta_value {
                    return Err(XyPrissError::ImmutableConfig {
                        path: path.to_string(),
                    });
                }
                Ok(())
            }
        }
    } else {
        deep_merge(base, delta, path)
    }
}

/// Remove reserved flags before feeding the tree back through serde.
fn strip_flags(mut value: Value) -> Value {
    fn walk(value: &mut Value) {
        match value {
            Value::Object(map) => {
                map.remove(IMMUTABLE_FLAG);
                for child in map.values_mut() {
                    walk(child);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item);
                }
            }
            _ => {}
        }
    }
    walk(&mut value);
    value
}

fn top_level_paths(delta: &Value) -> Vec<String> {
    match delta {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

static GLOBAL: OnceLock<ConfigManager> = OnceLock::new();

/// Install the process-wide manager.
///
/// A convenience for embedding scripts and the supervisor binary;
/// framework components always take an explicit handle through their
/// constructors and never read this global on a hot path.
pub fn init_global(manager: ConfigManager) -> Result<(), XyPrissError> {
    GLOBAL.set(manager).map_err(|_| XyPrissError::Config {
        message: "global configuration already initialized".to_string(),
    })
}

pub fn global() -> Option<&'static ConfigManager> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_validate() {
        XyPrissConfig::default().validate().unwrap();
    }

    #[test]
    fn xems_requires_a_decodable_secret() {
        let mut config = XyPrissConfig::default();
        config.xems.enabled = true;
        assert!(config.validate().is_err());

        config.xems.secret = Some("too-short".to_string());
        assert!(config.validate().is_err());

        config.xems.secret = Some("a".repeat(64));
        config.validate().unwrap();
    }

    #[test]
    fn camel_case_toml_round_trips() {
        let toml_text = r#"
            [server]
            port = 9090
            trustProxy = true

            [server.compression]
            algorithms = ["br"]
            threshold = 2048

            [requestManagement.timeouts]
            defaultTimeout = "10s"

            [requestManagement.timeouts.routes]
            "/slow" = "2m"

            [cluster]
            enabled = true
            workers = 4
        "#;
        let config: XyPrissConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.server.trust_proxy);
        assert_eq!(config.server.compression.algorithms, vec!["br"]);
        assert_eq!(
            config.request_management.timeouts.default_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(
            config.request_management.timeouts.routes["/slow"],
            Duration::from_secs(120)
        );
        assert_eq!(config.cluster.workers, WorkerCount::Fixed(4));
    }

    #[test]
    fn worker_count_accepts_auto() {
        let config: XyPrissConfig = toml::from_str("[cluster]\nworkers = \"auto\"").unwrap();
        assert_eq!(config.cluster.workers, WorkerCount::Auto);
        assert!(config.cluster.workers.resolve() >= 1);
    }

    #[test]
    fn objects_merge_recursively_and_idempotently() {
        let mut base = json!({"server": {"port": 8080, "host": "a"}});
        let delta = json!({"server": {"port": 9090}});
        deep_merge(&mut base, &delta, "").unwrap();
        assert_eq!(base, json!({"server": {"port": 9090, "host": "a"}}));

        // merge(merge(C, delta), delta) == merge(C, delta)
        let once = base.clone();
        deep_merge(&mut base, &delta, "").unwrap();
        assert_eq!(base, once);
    }

    #[test]
    fn arrays_concatenate() {
        let mut base = json!({"logging": {"suppressPatterns": ["a"]}});
        let delta = json!({"logging": {"suppressPatterns": ["b"]}});
        deep_merge(&mut base, &delta, "").unwrap();
        assert_eq!(
            base["logging"]["suppressPatterns"],
            json!(["a", "b"])
        );
    }

    #[test]
    fn sealed_subtree_rejects_changed_values() {
        let mut base = json!({
            "security": {"__isXyPrissImmutable": true, "debug": false}
        });
        let same = json!({"security": {"debug": false}});
        deep_merge(&mut base, &same, "").unwrap();

        let changed = json!({"security": {"debug": true}});
        let error = deep_merge(&mut base, &changed, "").unwrap_err();
        assert!(matches!(error, XyPrissError::ImmutableConfig { .. }));

        let added = json!({"security": {"extra": 1}});
        assert!(deep_merge(&mut base, &added, "").is_err());
    }

    #[test]
    fn sealing_reaches_nested_objects() {
        let mut base = json!({
            "xems": {"__isXyPrissImmutable": true, "cookie": {"name": "xems_token"}}
        });
        let nested_change = json!({"xems": {"cookie": {"name": "other"}}});
        assert!(deep_merge(&mut base, &nested_change, "").is_err());
    }

    #[test]
    fn manager_updates_typed_view_and_notifies() {
        let manager = ConfigManager::new(XyPrissConfig::default()).unwrap();
        let mut events = manager.subscribe();

        manager
            .update(json!({"server": {"port": 9999}}))
            .unwrap();
        assert_eq!(manager.typed().server.port, 9999);
        assert_eq!(
            manager.get_path("server.port"),
            Some(json!(9999))
        );

        let change = events.try_recv().unwrap();
        assert_eq!(change.paths, vec!["server".to_string()]);
    }

    #[test]
    fn manager_rejects_immutable_violation_without_partial_apply() {
        let manager = ConfigManager::new(XyPrissConfig::default()).unwrap();
        manager
            .update(json!({"custom": {"__isXyPrissImmutable": true, "value": 1}}))
            .unwrap();

        let error = manager
            .update(json!({"custom": {"value": 2}}))
            .unwrap_err();
        assert!(matches!(error, XyPrissError::ImmutableConfig { .. }));
        // The failed update must not have leaked any change.
        assert_eq!(manager.get_path("custom.value"), Some(json!(1)));
    }

    #[test]
    fn secret_decoding_accepts_hex_and_base64() {
        use base64::Engine;
        let hex = "ab".repeat(32);
        assert_eq!(decode_secret(&hex).unwrap()[0], 0xab);

        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(decode_secret(&b64).unwrap(), [7u8; 32]);

        assert!(decode_secret("nope").is_err());
    }
}
