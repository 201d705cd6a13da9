//! # Server Assembly & Request Pipeline
//!
//! This module wires every subsystem together and exposes the
//! framework's programmable surface. [`XyPrissServer`] is what an
//! application touches: route registration, plugin registration, and
//! `serve`. The transport is axum; everything behind the fallback
//! handler speaks the framework's own request/response adapters.
//!
//! ## Overview
//!
//! The server is responsible for:
//!
//! - **Assembly**: building the shared [`AppState`] out of the
//!   configuration manager, plugin registry and engine, router,
//!   connection pool, compression policy, security chain, XEMS store,
//!   proxy routes, and metrics recorder
//! - **Built-in endpoints**: `/health`, `/metrics`, and the `/admin/*`
//!   surface, served outside the pipeline
//! - **The pipeline**: the fallback handler that carries every
//!   user-facing request through the full data flow
//! - **Binding**: SO_REUSEPORT sockets for cluster workers, with
//!   auto-port-switch probing when the configured port is taken
//! - **Lifecycle**: boot-time plugin initialization, background loops,
//!   `onServerReady`, and graceful shutdown with drain
//!
//! ## Request Data Flow
//!
//! Leaves first: transport accept → adapter → connection plugin
//! annotates → security chain classifies → XEMS binding → plugin
//! `onRequest` hooks → middleware buckets (first, normal, last) →
//! plugin engine → proxy routes (bypassing the user handler) or router
//! match → user handler → response hooks and header modifications →
//! compression → finalize (token rotation callbacks run here) → wire.
//!
//! ## Boot Order
//!
//! `serve` initializes the plugin registry (a dependency cycle is fatal
//! here), binds with auto-port-switch fallback, spawns the background
//! loops (connection sweeper, XEMS sweeper, upstream health checks, the
//! performance-metrics snapshot), fires `onServerReady`, then accepts
//! until the shutdown signal and drains.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::adapter::XyResponse;
//! use xypriss::config::XyPrissConfig;
//! use xypriss::router::handler;
//! use xypriss::server::XyPrissServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = XyPrissConfig::load("xypriss.toml")?;
//!     let server = XyPrissServer::build(config).await?;
//!
//!     server.get("/items/:id", handler(|req| async move {
//!         let mut res = XyResponse::new();
//!         res.json(&serde_json::json!({"item": req.param("id")}))?;
//!         Ok(res)
//!     }))?;
//!
//!     server.serve().await
//! }
//! ```
//!
//! ## Error Handling
//!
//! Every pipeline rejection maps to the stable error envelope through
//! [`XyPrissError`]: 403 for security blocks, 404 for unmatched routes,
//! 408 for request deadlines, 429 for rate limits, 502/504 for upstream
//! failures, and 503 when the concurrency cap rejects. User-handler
//! failures run the `onError` recovery chain first; only unrecovered
//! errors surface as envelopes.

use crate::adapter::{CookieOptions, XyRequest, XyResponse};
use crate::config::{
    deep_merge, ConfigManager, ProxyRouteSection, ServerSection, XyPrissConfig,
};
use crate::error::XyPrissError;
use crate::logging;
use crate::metrics::MetricsRecorder;
use crate::network::{CompressionPolicy, ConnectionManager, PushPlanner};
use crate::plugins::context::NetworkContext;
use crate::plugins::engine::{EngineConfig, PluginEngine};
use crate::plugins::registry::PluginRegistry;
use crate::plugins::{MiddlewareFlow, XyPlugin};
use crate::router::{RouteHandler, XyRouter};
use crate::security::xems::XemsStore;
use crate::security::SecurityChain;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::timeout::TimeoutLayer;
use xypriss_net::{HealthChecker, LoadBalancer, ProxyConfig, ProxyForwarder, UpstreamPool};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// One proxied path prefix and its forwarder.
pub struct ProxyRoute {
    pub prefix: String,
    pub forwarder: Arc<ProxyForwarder>,
    pub pool: Arc<UpstreamPool>,
}

/// Everything the request pipeline needs, shared across handlers.
///
/// # Thread Safety
///
/// All fields are `Arc`-wrapped (or cheaply cloneable handles), so the
/// state clones into every handler invocation the way the transport
/// expects.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigManager,
    pub registry: Arc<PluginRegistry>,
    pub engine: Arc<PluginEngine>,
    pub router: Arc<XyRouter>,
    pub connections: Arc<ConnectionManager>,
    pub compression: Arc<CompressionPolicy>,
    pub push: Option<Arc<PushPlanner>>,
    pub security: Arc<SecurityChain>,
    pub xems: Option<Arc<XemsStore>>,
    pub proxy_routes: Arc<Vec<ProxyRoute>>,
    pub metrics: Arc<MetricsRecorder>,
    concurrency: Option<Arc<Semaphore>>,
    per_ip: Option<Arc<PerIpLimiter>>,
}

/// Per-IP in-flight request counter.
struct PerIpLimiter {
    counts: DashMap<String, usize>,
    max_per_ip: usize,
}

impl PerIpLimiter {
    fn try_enter(self: &Arc<Self>, ip: &str) -> Option<PerIpGuard> {
        let mut entry = self.counts.entry(ip.to_string()).or_insert(0);
        if *entry >= self.max_per_ip {
            return None;
        }
        *entry += 1;
        drop(entry);
        Some(PerIpGuard {
            limiter: Arc::clone(self),
            ip: ip.to_string(),
        })
    }
}

struct PerIpGuard {
    limiter: Arc<PerIpLimiter>,
    ip: String,
}

impl Drop for PerIpGuard {
    fn drop(&mut self) {
        let mut drained = false;
        if let Some(mut entry) = self.limiter.counts.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            drained = *entry == 0;
        }
        if drained {
            self.limiter.counts.remove_if(&self.ip, |_, count| *count == 0);
        }
    }
}

/// The framework server.
///
/// Built once from a validated configuration, decorated with routes and
/// plugins, then consumed by [`serve`](Self::serve). Tests drive the
/// assembled application directly through [`app`](Self::app).
pub struct XyPrissServer {
    state: AppState,
    worker_mode: bool,
}

impl XyPrissServer {
    /// Assemble the server from a validated configuration.
    ///
    /// This constructs every subsystem and registers the built-in
    /// plugins named in `plugins.register`, but does not bind or
    /// resolve the plugin order; that happens in
    /// [`serve`](Self::serve).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid XEMS secret, an unknown built-in
    /// plugin name, or a plugin registration failure. All of these are
    /// fatal at boot.
    pub async fn build(config: XyPrissConfig) -> anyhow::Result<Self> {
        let manager = ConfigManager::new(config.clone())?;
        let typed = manager.typed();

        let registry = Arc::new(PluginRegistry::new(
            typed.plugins.plugin_permissions.clone(),
        ));
        let engine = Arc::new(PluginEngine::new(
            Arc::clone(&registry),
            EngineConfig {
                context_pool_size: typed.plugins.context_pool_size,
                cache_enabled: typed.cache.enabled,
                cache_max_entries: typed.cache.max_entries,
                cache_ttl: typed.cache.ttl,
                ..Default::default()
            },
        ));

        let xems = if typed.xems.enabled {
            Some(Arc::new(XemsStore::new(typed.xems.clone()).map_err(
                |error| anyhow::anyhow!("fatal: {error}"),
            )?))
        } else {
            None
        };

        let proxy_routes = if typed.proxy.enabled {
            build_proxy_routes(&typed.proxy.routes)
        } else {
            Vec::new()
        };

        let push = typed
            .server
            .push
            .enabled
            .then(|| {
                typed
                    .server
                    .push
                    .root_dir
                    .as_ref()
                    .map(|root| Arc::new(PushPlanner::new(root)))
            })
            .flatten();

        let concurrency = typed
            .request_management
            .concurrency
            .max_concurrent_requests
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let per_ip = typed
            .request_management
            .concurrency
            .max_per_ip
            .map(|max| {
                Arc::new(PerIpLimiter {
                    counts: DashMap::new(),
                    max_per_ip: max.max(1),
                })
            });

        // Built-in plugins named in `plugins.register` join the registry
        // before boot; unknown names are fatal (misconfiguration).
        for section in &typed.plugins.register {
            if !section.enabled {
                continue;
            }
            let plugin = crate::plugins::builtin::create_plugin(section)?;
            let config = serde_json::to_value(&section.config).ok();
            registry.register(plugin, config).await?;
        }

        let state = AppState {
            registry,
            engine,
            router: Arc::new(XyRouter::new()),
            connections: Arc::new(ConnectionManager::new(typed.server.connection.clone())),
            compression: Arc::new(CompressionPolicy::new(&typed.server.compression)),
            push,
            security: Arc::new(SecurityChain::new(&typed.security)),
            xems,
            proxy_routes: Arc::new(proxy_routes),
            metrics: Arc::new(MetricsRecorder::new()),
            concurrency,
            per_ip,
            config: manager,
        };

        Ok(Self {
            state,
            worker_mode: false,
        })
    }

    /// Mark this instance as a cluster worker (SO_REUSEPORT binding,
    /// stderr logging handled by the binary).
    pub fn worker_mode(mut self) -> Self {
        self.worker_mode = true;
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // Route registration surface.

    pub fn get(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        self.state.router.add(Method::GET, pattern, handler)
    }

    pub fn post(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        self.state.router.add(Method::POST, pattern, handler)
    }

    pub fn put(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        self.state.router.add(Method::PUT, pattern, handler)
    }

    pub fn delete(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        self.state.router.add(Method::DELETE, pattern, handler)
    }

    pub fn all(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        self.state.router.add_any(pattern, handler)
    }

    /// Register a plugin. Before `serve` the plugin waits for boot;
    /// afterwards it is integrated immediately.
    pub async fn register_plugin(
        &self,
        plugin: Arc<dyn XyPlugin>,
        config: Option<serde_json::Value>,
    ) -> Result<(), XyPrissError> {
        self.state.registry.register(plugin, config).await
    }

    /// The assembled axum application (used directly by tests).
    pub fn app(&self) -> Router {
        let typed = self.state.config.typed();
        Router::new()
            .route("/health", get(health_endpoint))
            .route("/metrics", get(metrics_endpoint))
            .merge(crate::admin::admin_routes())
            .fallback(dispatch)
            .layer(TimeoutLayer::new(
                typed.request_management.timeouts.default_timeout,
            ))
            .with_state(self.state.clone())
    }

    /// Initialize plugins and serve until shutdown.
    ///
    /// Runs the full boot order described in the module documentation,
    /// then accepts until ctrl-c (or SIGTERM on Unix), drains in-flight
    /// requests, and fires `onServerStop` across the registry.
    ///
    /// # Errors
    ///
    /// Fails on a plugin dependency cycle, port exhaustion after
    /// auto-port-switch, or a malformed `multiServer` override. The
    /// binary exits non-zero on any of these.
    pub async fn serve(self) -> anyhow::Result<()> {
        // A dependency cycle or invalid plugin set must stop the boot.
        self.state.registry.initialize().await?;

        let typed = self.state.config.typed();
        let listener = bind_listener(&typed.server, self.worker_mode).await?;
        let local = listener.local_addr()?;

        let background = self.spawn_background_tasks();
        self.state.registry.fire_server_ready().await;
        tracing::info!(address = %local, "xypriss serving");

        let mut extra_listeners = Vec::new();
        if typed.multi_server.enabled {
            extra_listeners = self.bind_multi_servers(&typed).await?;
        }

        let state = self.state.clone();
        let app = self.app();
        for (name, extra) in extra_listeners {
            let app = app.clone();
            tracing::info!(server = %name, address = %extra.local_addr()?, "sub-server serving");
            tokio::spawn(async move {
                let service =
                    app.into_make_service_with_connect_info::<SocketAddr>();
                if let Err(error) = axum::serve(extra, service).await {
                    tracing::error!(server = %name, %error, "sub-server failed");
                }
            });
        }

        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("listener closed, stopping plugins");
        state.registry.shutdown().await;
        for handle in background {
            handle.abort();
        }
        Ok(())
    }

    fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.state.connections.spawn_sweeper()];
        if let Some(store) = &self.state.xems {
            handles.push(store.spawn_sweeper());
        }

        // Periodic performance snapshot for the onPerformanceMetrics hook.
        let snapshot_state = self.state.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = serde_json::json!({
                    "requests": snapshot_state.metrics.aggregated(),
                    "connections": snapshot_state.connections.stats(),
                    "contextPool": snapshot_state.engine.pool_stats(),
                });
                snapshot_state
                    .registry
                    .notify_performance_metrics(&snapshot)
                    .await;
            }
        }));
        let typed = self.state.config.typed();
        for route in self.state.proxy_routes.iter() {
            let checker = Arc::new(HealthChecker::new(
                Arc::clone(&route.pool),
                typed.proxy.health_check.clone(),
            ));
            handles.push(checker.spawn());
        }
        handles
    }

    /// Additional listeners from `multiServer.servers`: each entry's
    /// overrides are deep-merged over the base tree and the resulting
    /// server section decides the bind address. All listeners share one
    /// pipeline.
    async fn bind_multi_servers(
        &self,
        typed: &XyPrissConfig,
    ) -> anyhow::Result<Vec<(String, TcpListener)>> {
        let mut listeners = Vec::new();
        for entry in &typed.multi_server.servers {
            let mut tree = self.state.config.tree();
            deep_merge(&mut tree, &entry.overrides, "")
                .map_err(|error| anyhow::anyhow!("multiServer '{}': {error}", entry.name))?;
            let merged: XyPrissConfig = serde_json::from_value(tree)?;
            let listener = bind_listener(&merged.server, self.worker_mode).await?;
            listeners.push((entry.name.clone(), listener));
        }
        Ok(listeners)
    }
}

/// Bind the listening socket, probing alternate ports when the
/// configured one is taken and auto-port-switch allows it. Workers set
/// SO_REUSEPORT so the kernel spreads accepts across the pool.
async fn bind_listener(server: &ServerSection, reuse_port: bool) -> anyhow::Result<TcpListener> {
    let mut candidates: Vec<u16> = vec![server.port];
    if server.auto_port_switch.enabled {
        let attempts = server.auto_port_switch.max_attempts.max(1);
        match server.auto_port_switch.strategy {
            crate::config::PortSwitchStrategy::Increment => {
                for offset in 1..=attempts {
                    candidates.push(server.port.saturating_add(offset as u16));
                }
            }
            crate::config::PortSwitchStrategy::Random => {
                use rand::Rng;
                let (low, high) = server
                    .auto_port_switch
                    .port_range
                    .unwrap_or((49152, 65535));
                let mut rng = rand::thread_rng();
                for _ in 0..attempts {
                    candidates.push(rng.gen_range(low..=high));
                }
            }
        }
    }

    let mut last_error: Option<std::io::Error> = None;
    for (attempt, port) in candidates.iter().enumerate() {
        match try_bind(&server.host, *port, reuse_port) {
            Ok(listener) => {
                if attempt > 0 {
                    tracing::warn!(
                        configured = server.port,
                        bound = port,
                        "configured port unavailable, auto-switched"
                    );
                }
                return Ok(listener);
            }
            Err(error) => last_error = Some(error),
        }
    }
    Err(anyhow::anyhow!(
        "fatal: no bindable port after {} attempts: {}",
        candidates.len(),
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string())
    ))
}

fn try_bind(host: &str, port: u16, reuse_port: bool) -> std::io::Result<TcpListener> {
    let address: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let domain = if address.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn health_endpoint(State(state): State<AppState>) -> Response {
    let report = state.metrics.health(state.connections.len());
    axum::Json(report).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "requests": state.metrics.aggregated(),
        "connections": state.connections.stats(),
        "plugins": state.engine.health().await,
        "uptime_seconds": state.metrics.uptime().as_secs(),
    });
    axum::Json(body).into_response()
}

/// The pipeline entry point for every non-builtin route.
///
/// Wraps [`run_pipeline`] so every exit path, rejections included,
/// lands in the metrics window and the `onRequestTiming` hook.
async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let path = req.uri().path().to_string();

    let response = run_pipeline(&state, req).await;

    let elapsed = started.elapsed();
    state.metrics.record(response.status().as_u16(), elapsed);
    state.registry.notify_timing(&path, elapsed).await;
    response
}

/// One request through the full data flow; see the module docs for the
/// stage order. Each stage owns its rejection, and the pooled context
/// is released on every exit path past its acquisition.
async fn run_pipeline(state: &AppState, req: Request<Body>) -> Response {
    let typed = state.config.typed();
    let (parts, body) = req.into_parts();

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
    let http2 = parts.version == Version::HTTP_2;

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return XyPrissError::Internal {
                message: "request body too large or unreadable".to_string(),
            }
            .into_response()
        }
    };

    let mut xreq = XyRequest::adapt(
        parts.method,
        parts.uri,
        parts.headers,
        body,
        remote,
        typed.server.trust_proxy,
        http2,
        false,
    );
    let client_ip = xreq.ip();

    // Concurrency caps answer before any further work happens.
    let _permit = match &state.concurrency {
        Some(semaphore) => {
            match tokio::time::timeout(Duration::from_secs(1), Arc::clone(semaphore).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => Some(permit),
                _ => return XyPrissError::Overloaded.into_response(),
            }
        }
        None => None,
    };
    let _ip_guard = match &state.per_ip {
        Some(limiter) => match limiter.try_enter(&client_ip) {
            Some(guard) => Some(guard),
            None => {
                state.registry.notify_rate_limit(&client_ip, &xreq.path).await;
                return XyPrissError::RateLimit {
                    message: "too many concurrent requests from this address".to_string(),
                }
                .into_response();
            }
        },
        None => None,
    };

    // Connection plugin annotates first.
    let touch = state.connections.touch(remote, http2, xreq.secure);

    // Security chain classifies before anything user-visible runs.
    let decision = state.security.inspect(&xreq);
    for attack in &decision.attacks {
        state.registry.notify_attack(attack).await;
    }
    if let Some(block) = decision.block {
        return XyPrissError::Security(block).into_response();
    }

    // XEMS binding: resolve, attach, remember the rotation for finalize.
    let mut rotated_token: Option<String> = None;
    if let Some(store) = &state.xems {
        let cfg = store.config();
        let token = xreq
            .cookie(&cfg.cookie_name)
            .map(str::to_string)
            .or_else(|| xreq.header(&cfg.header_name).map(str::to_string));
        if let Some(token) = token {
            let options = store.default_options(&cfg.sandbox);
            match store.resolve_session(&token, &options) {
                Ok(Some(resolved)) => {
                    xreq.extensions
                        .insert(cfg.attach_to.clone(), resolved.data.clone());
                    xreq.session = Some(resolved.data);
                    rotated_token = resolved.new_token;
                }
                Ok(None) => {}
                Err(error) => tracing::error!(%error, "session resolve failed"),
            }
        }
    }

    // Server-push planning wants the unconsumed request; no pusher is
    // exposed by this transport, so the planner no-ops by design.
    if let Some(planner) = &state.push {
        planner.plan(&xreq, None);
    }

    // Request facts that outlive the handler taking ownership.
    let accept_encoding = xreq.header("accept-encoding").unwrap_or("").to_string();
    let compression_vetoed = state.compression.vetoed(&xreq);
    let request_path = xreq.path.clone();
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut ctx = state.engine.acquire_context(
        request_id.clone(),
        NetworkContext {
            remote_addr: remote.ip().to_string(),
            remote_port: remote.port(),
            local_addr: typed.server.host.clone(),
            local_port: typed.server.port,
            encrypted: xreq.secure,
            protocol: xreq.protocol.clone(),
        },
    );

    state.registry.run_request_hooks(&mut ctx, &mut xreq).await;

    // Middleware buckets: first → normal → last, plugin order within.
    let (first, normal, last) = state.registry.middleware_buckets();
    for middleware in first.iter().chain(normal.iter()).chain(last.iter()) {
        match middleware(&mut xreq, &mut ctx).await {
            Ok(MiddlewareFlow::Continue) => {}
            Ok(MiddlewareFlow::Halt(response)) => {
                let response = *response;
                state.engine.release_context(ctx);
                return response.into_axum();
            }
            Err(error) => {
                state.engine.release_context(ctx);
                return error.into_response();
            }
        }
    }

    let outcome = state.engine.run(&mut ctx, &mut xreq).await;
    if outcome.halted {
        // The halting plugin may carry its own status (the rate limiter
        // sends 429); anything else aborts as forbidden.
        let status = outcome
            .halt_data
            .as_ref()
            .and_then(|data| data.get("status"))
            .and_then(|status| status.as_u64())
            .unwrap_or(403) as u16;
        if status == 429 {
            state.registry.notify_rate_limit(&client_ip, &request_path).await;
        }
        let mut response = XyResponse::new();
        response.status(status);
        match &outcome.halt_data {
            Some(data) => {
                let _ = response.json(data);
            }
            None => {
                response.send("request aborted by pipeline");
            }
        }
        state.engine.release_context(ctx);
        return response.into_axum();
    }

    // Proxy routes bypass the user handler entirely.
    if let Some(route) = state
        .proxy_routes
        .iter()
        .find(|route| request_path.starts_with(&route.prefix))
    {
        let response = proxy_forward(route, &xreq, &client_ip, &request_id).await;
        state.engine.release_context(ctx);
        return response;
    }

    // Router match and user handler.
    let mut response = match state.router.find(&xreq.method, &xreq.path) {
        None => {
            state.engine.release_context(ctx);
            return XyPrissError::NotFound {
                method: xreq.method.to_string(),
                path: xreq.path.clone(),
            }
            .into_response();
        }
        Some(matched) => {
            xreq.params = matched.params;
            let deadline = route_timeout(&typed, &request_path);
            let handler_future = (matched.handler)(xreq);
            match tokio::time::timeout(deadline, handler_future).await {
                Err(_) => {
                    state.engine.release_context(ctx);
                    return XyPrissError::RequestTimeout.into_response();
                }
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    // Route the failure through every onError hook; the
                    // first hook that writes a response wins.
                    let mut recovery = XyResponse::new();
                    let recovered = state
                        .registry
                        .dispatch_error(&mut ctx, &error, &mut recovery)
                        .await;
                    state.registry.notify_route_error(&request_path, &error).await;
                    if recovered {
                        recovery
                    } else {
                        state.engine.release_context(ctx);
                        return error.into_response();
                    }
                }
            }
        }
    };

    // Response phase: engine header modifications, connection headers,
    // response hooks, rotation finalizer, compression, finalize.
    for (name, value) in &outcome.headers {
        response.set_header(name, value);
    }
    for (name, value) in &touch.headers {
        response.set_header(name, value);
    }
    response.set_header("x-request-id", &request_id);
    // The connection plugin's response deadline covers the hook phase;
    // nothing has hit the wire yet, so expiry maps to 504.
    let hook_phase = state.registry.run_response_hooks(&mut ctx, &mut response);
    if tokio::time::timeout(typed.server.connection.response_timeout, hook_phase)
        .await
        .is_err()
    {
        state.engine.release_context(ctx);
        return XyPrissError::UpstreamTimeout.into_response();
    }

    if let (Some(store), Some(new_token)) = (&state.xems, rotated_token) {
        let cfg = store.config().clone();
        response.on_finalize(move |r| {
            r.set_header(&cfg.header_name, &new_token);
            r.cookie(&cfg.cookie_name, &new_token, &CookieOptions::default());
        });
    }

    if let Some(algorithm) =
        state
            .compression
            .negotiate_parts(&accept_encoding, response.body_len(), compression_vetoed)
    {
        let compressed = state.compression.compress(algorithm, response.body());
        response.set_body(compressed);
        response.set_header("content-encoding", algorithm.token());
        response.append_header("vary", "accept-encoding");
    }

    state.engine.release_context(ctx);
    response.into_axum()
}

async fn proxy_forward(
    route: &ProxyRoute,
    xreq: &XyRequest,
    client_ip: &str,
    request_id: &str,
) -> Response {
    let forward = xypriss_net::ForwardRequest {
        method: xreq.method.clone(),
        path_and_query: xreq.path_and_query(),
        headers: xreq.raw_headers.clone(),
        body: xreq.body.clone(),
        client_ip: client_ip.to_string(),
        request_id: request_id.to_string(),
    };
    match route.forwarder.forward(forward).await {
        Ok(upstream) => {
            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            *response.headers_mut() = upstream.headers;
            response
        }
        Err(error) => XyPrissError::Proxy(error).into_response(),
    }
}

/// Longest matching prefix in `timeouts.routes`, else the default
/// capped by the connection plugin's per-request deadline.
fn route_timeout(typed: &XyPrissConfig, path: &str) -> Duration {
    let per_route = typed
        .request_management
        .timeouts
        .routes
        .iter()
        .filter(|(route, _)| path.starts_with(route.as_str()))
        .max_by_key(|(route, _)| route.len())
        .map(|(_, timeout)| *timeout);
    match per_route {
        Some(timeout) => timeout,
        None => typed
            .request_management
            .timeouts
            .default_timeout
            .min(typed.server.connection.request_timeout),
    }
}

fn build_proxy_routes(sections: &[ProxyRouteSection]) -> Vec<ProxyRoute> {
    sections
        .iter()
        .map(|section| {
            let pool = Arc::new(UpstreamPool::new(section.upstreams.clone()));
            let forwarder = Arc::new(ProxyForwarder::new(
                Arc::clone(&pool),
                LoadBalancer::new(section.strategy),
                ProxyConfig {
                    retries: section.retries,
                    timeout: section.timeout,
                    ..Default::default()
                },
            ));
            ProxyRoute {
                prefix: section.prefix.clone(),
                forwarder,
                pool,
            }
        })
        .collect()
}

/// Convenience used by the binary: build, apply logging, serve.
pub async fn run(config: XyPrissConfig, worker: bool) -> anyhow::Result<()> {
    if worker {
        logging::init_worker(&config.logging);
    } else {
        logging::init(&config.logging);
    }
    let server = XyPrissServer::build(config).await?;
    let server = if worker { server.worker_mode() } else { server };
    server.serve().await
}
