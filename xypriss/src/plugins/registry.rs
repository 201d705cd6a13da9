//! # Plugin Registry
//!
//! This module owns the set of registered plugins and everything that
//! derives from it: the total execution order, the composed middleware
//! buckets, the hook allow-list, and the fan-out helpers the pipeline
//! uses to fire lifecycle hooks.
//!
//! ## Overview
//!
//! The registry provides:
//!
//! - **Registration**: validation of the plugin spec, duplicate
//!   detection (a duplicate id logs a warning and is ignored), and the
//!   `onRegister` hook.
//! - **Execution Ordering**: dependencies first (topological), then
//!   priority within each dependency layer (critical before high before
//!   normal before low), then registration order as the final
//!   tie-break.
//! - **Cycle Detection**: a dependency cycle fails `initialize` with an
//!   error naming every vertex on the cycle, so the boot log points at
//!   the exact offending plugins.
//! - **Late Registration**: a plugin registered after boot is fully
//!   integrated before `register` returns; the order is recomputed and
//!   the newcomer's start hooks fire immediately.
//! - **Hook Dispatch**: `onRequest` / `onResponse` walks, the `onError`
//!   recovery chain, and the notify helpers for security, timing, rate
//!   limit, and performance events. Every hook call is isolated: one
//!   failing hook is logged and the walk continues.
//! - **Permissions**: the configured `pluginPermissions` allow-list
//!   gates each hook per plugin; plugins without an entry keep every
//!   hook.
//!
//! ## Ordering Algorithm
//!
//! The order is computed with a layered Kahn pass: each round collects
//! every plugin whose dependencies are already placed, sorts that layer
//! by (priority, registration index), and appends it. When a round
//! finds no ready plugin, the leftover subgraph necessarily contains a
//! cycle, and a depth-first walk extracts one concrete cycle verbatim
//! for the error message.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::plugins::registry::PluginRegistry;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(PluginRegistry::new(permissions));
//!
//! // Boot: register everything, then resolve the order once.
//! registry.register(my_plugin, None).await?;
//! registry.initialize().await?;
//! assert!(registry.is_initialized());
//!
//! // Per request, in pipeline order:
//! for plugin in registry.ordered_plugins() {
//!     // ... engine executes each plugin ...
//! }
//! ```
//!
//! ## Concurrency
//!
//! The registry is read-mostly after boot: per-request walks take a
//! snapshot under a short read lock, while late registration takes the
//! write path. No lock is held across an `await`.

use super::context::ExecutionContext;
use super::{AttackData, HookKind, MiddlewareFn, XyPlugin};
use crate::adapter::{XyRequest, XyResponse};
use crate::config::PluginPermissionSection;
use crate::error::XyPrissError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Registered {
    plugin: Arc<dyn XyPlugin>,
    registration_index: usize,
}

/// Owns the plugin set and the total execution order.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Registered>>,
    order: RwLock<Vec<String>>,
    initialized: AtomicBool,
    permissions: Vec<PluginPermissionSection>,
    counter: AtomicUsize,
}

impl PluginRegistry {
    pub fn new(permissions: Vec<PluginPermissionSection>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            initialized: AtomicBool::new(false),
            permissions,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Register a plugin.
    ///
    /// Specs missing an id, name, or version are rejected; a duplicate
    /// id logs a warning and leaves the registry untouched. After boot
    /// the plugin is integrated immediately: the order is recomputed and
    /// the newcomer's `onServerStart` / `onServerReady` hooks fire
    /// before this method returns.
    ///
    /// # Arguments
    ///
    /// * `plugin` - The plugin implementation
    /// * `config` - Plugin-specific configuration passed to `onRegister`
    ///
    /// # Errors
    ///
    /// Returns an error for an incomplete spec, or when late
    /// registration produces an unresolvable order (unknown dependency
    /// or a new cycle).
    pub async fn register(
        &self,
        plugin: Arc<dyn XyPlugin>,
        config: Option<serde_json::Value>,
    ) -> Result<(), XyPrissError> {
        let spec = plugin.spec().clone();
        if spec.id.is_empty() || spec.name.is_empty() || spec.version.is_empty() {
            return Err(XyPrissError::Plugin {
                message: "plugin spec requires id, name, and version".to_string(),
            });
        }

        {
            let mut plugins = self.plugins.write();
            if plugins.contains_key(&spec.id) {
                tracing::warn!(plugin = %spec.id, "plugin already registered, ignoring");
                return Ok(());
            }
            let registration_index = self.counter.fetch_add(1, Ordering::Relaxed);
            plugins.insert(
                spec.id.clone(),
                Registered {
                    plugin: Arc::clone(&plugin),
                    registration_index,
                },
            );
        }

        if self.hook_allowed(&spec.id, HookKind::OnRegister) {
            let config = config.unwrap_or(serde_json::Value::Null);
            if let Err(error) = plugin.on_register(&config).await {
                tracing::error!(plugin = %spec.id, %error, "onRegister hook failed");
            }
        }
        tracing::info!(plugin = %spec.id, version = %spec.version, "plugin registered");

        // Late registration: the boot sequence already ran, so integrate
        // the newcomer right now.
        if self.is_initialized() {
            self.recompute_order()?;
            if self.hook_allowed(&spec.id, HookKind::OnServerStart) {
                if let Err(error) = plugin.on_server_start().await {
                    tracing::error!(plugin = %spec.id, %error, "onServerStart hook failed");
                }
            }
            if self.hook_allowed(&spec.id, HookKind::OnServerReady) {
                if let Err(error) = plugin.on_server_ready().await {
                    tracing::error!(plugin = %spec.id, %error, "onServerReady hook failed");
                }
            }
        }
        Ok(())
    }

    /// Resolve the execution order and fire `onServerStart` across it.
    ///
    /// This is the boot barrier: the server must not accept traffic
    /// until it succeeds.
    ///
    /// # Errors
    ///
    /// Fails with [`XyPrissError::PluginCycle`] naming every vertex on
    /// the cycle, or with a plugin error for an unknown dependency. The
    /// registry stays uninitialized on failure.
    pub async fn initialize(&self) -> Result<(), XyPrissError> {
        self.recompute_order()?;
        self.initialized.store(true, Ordering::Release);

        for plugin in self.ordered_plugins() {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnServerStart) {
                continue;
            }
            if let Err(error) = plugin.on_server_start().await {
                tracing::error!(plugin = %id, %error, "onServerStart hook failed");
            }
        }
        tracing::info!(
            plugins = self.plugins.read().len(),
            "plugin registry initialized"
        );
        Ok(())
    }

    /// Fire `onServerReady` across the order; called once the listener is
    /// bound.
    pub async fn fire_server_ready(&self) {
        for plugin in self.ordered_plugins() {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnServerReady) {
                continue;
            }
            if let Err(error) = plugin.on_server_ready().await {
                tracing::error!(plugin = %id, %error, "onServerReady hook failed");
            }
        }
    }

    /// `onServerStop` in reverse execution order.
    pub async fn shutdown(&self) {
        for plugin in self.ordered_plugins().into_iter().rev() {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnServerStop) {
                continue;
            }
            if let Err(error) = plugin.on_server_stop().await {
                tracing::error!(plugin = %id, %error, "onServerStop hook failed");
            }
        }
    }

    /// Current execution order (plugin ids).
    pub fn execution_order(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Plugins in execution order.
    pub fn ordered_plugins(&self) -> Vec<Arc<dyn XyPlugin>> {
        let plugins = self.plugins.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| plugins.get(id).map(|r| Arc::clone(&r.plugin)))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn XyPlugin>> {
        self.plugins.read().get(id).map(|r| Arc::clone(&r.plugin))
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Middleware composed into (first, normal, last) buckets.
    ///
    /// Buckets are applied in that order by the pipeline; within one
    /// bucket, contributions follow the plugin execution order.
    ///
    /// # Returns
    ///
    /// The three bucket vectors, ready to be chained front to back.
    pub fn middleware_buckets(&self) -> (Vec<MiddlewareFn>, Vec<MiddlewareFn>, Vec<MiddlewareFn>) {
        let mut first = Vec::new();
        let mut normal = Vec::new();
        let mut last = Vec::new();
        for plugin in self.ordered_plugins() {
            let bucket = plugin.spec().middleware_bucket;
            let target = match bucket {
                super::MiddlewareBucket::First => &mut first,
                super::MiddlewareBucket::Normal => &mut normal,
                super::MiddlewareBucket::Last => &mut last,
            };
            target.extend(plugin.middleware());
        }
        (first, normal, last)
    }

    /// Whether the allow-list permits `hook` for `plugin`.
    ///
    /// Permission entries match on the plugin name or id; a plugin
    /// without an entry may use every hook.
    ///
    /// # Arguments
    ///
    /// * `plugin` - Plugin id (or name) to check
    /// * `hook` - The hook about to be invoked
    pub fn hook_allowed(&self, plugin: &str, hook: HookKind) -> bool {
        let plugins = self.plugins.read();
        let name = plugins
            .get(plugin)
            .map(|r| r.plugin.spec().name.clone())
            .unwrap_or_else(|| plugin.to_string());
        drop(plugins);

        match self
            .permissions
            .iter()
            .find(|p| p.name == name || p.name == plugin)
        {
            Some(entry) => entry.allowed_hooks.iter().any(|h| h == hook.as_str()),
            None => true,
        }
    }

    /// Run `onRequest` across the order; hook failures are isolated.
    pub async fn run_request_hooks(&self, ctx: &mut ExecutionContext, req: &mut XyRequest) {
        for plugin in self.ordered_plugins() {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnRequest) {
                continue;
            }
            if let Err(error) = plugin.on_request(ctx, req).await {
                tracing::error!(plugin = %id, %error, "onRequest hook failed");
            }
        }
    }

    /// Run `onResponse` across the order; hook failures are isolated.
    pub async fn run_response_hooks(&self, ctx: &mut ExecutionContext, res: &mut XyResponse) {
        for plugin in self.ordered_plugins() {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnResponse) {
                continue;
            }
            if let Err(error) = plugin.on_response(ctx, res).await {
                tracing::error!(plugin = %id, %error, "onResponse hook failed");
            }
        }
    }

    /// Route a handler error through every `onError` hook.
    ///
    /// Hooks run in registration order (not execution order, so early
    /// registrations get the first chance to answer); the first hook
    /// that reports it wrote a response wins and the chain stops.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The failing request's execution context
    /// * `error` - The handler failure being recovered
    /// * `res` - The response a hook may write into
    ///
    /// # Returns
    ///
    /// `true` when some hook recovered the request; the pipeline then
    /// sends `res` instead of the error envelope.
    pub async fn dispatch_error(
        &self,
        ctx: &mut ExecutionContext,
        error: &XyPrissError,
        res: &mut XyResponse,
    ) -> bool {
        let mut by_registration: Vec<(usize, Arc<dyn XyPlugin>)> = {
            let plugins = self.plugins.read();
            plugins
                .values()
                .map(|r| (r.registration_index, Arc::clone(&r.plugin)))
                .collect()
        };
        by_registration.sort_by_key(|(index, _)| *index);

        for (_, plugin) in by_registration {
            let id = plugin.spec().id.clone();
            if !self.hook_allowed(&id, HookKind::OnError) {
                continue;
            }
            match plugin.on_error(ctx, error, res).await {
                Ok(true) => {
                    tracing::debug!(plugin = %id, "onError hook handled the failure");
                    return true;
                }
                Ok(false) => {}
                Err(hook_error) => {
                    tracing::error!(plugin = %id, %hook_error, "onError hook failed");
                }
            }
        }
        false
    }

    pub async fn notify_attack(&self, attack: &AttackData) {
        for plugin in self.ordered_plugins() {
            if self.hook_allowed(&plugin.spec().id, HookKind::OnSecurityAttack) {
                plugin.on_security_attack(attack).await;
            }
        }
    }

    pub async fn notify_timing(&self, path: &str, elapsed: std::time::Duration) {
        for plugin in self.ordered_plugins() {
            if self.hook_allowed(&plugin.spec().id, HookKind::OnRequestTiming) {
                plugin.on_request_timing(path, elapsed).await;
            }
        }
    }

    pub async fn notify_performance_metrics(&self, snapshot: &serde_json::Value) {
        for plugin in self.ordered_plugins() {
            if self.hook_allowed(&plugin.spec().id, HookKind::OnPerformanceMetrics) {
                plugin.on_performance_metrics(snapshot).await;
            }
        }
    }

    pub async fn notify_rate_limit(&self, ip: &str, path: &str) {
        for plugin in self.ordered_plugins() {
            if self.hook_allowed(&plugin.spec().id, HookKind::OnRateLimit) {
                plugin.on_rate_limit(ip, path).await;
            }
        }
    }

    pub async fn notify_route_error(&self, path: &str, error: &XyPrissError) {
        for plugin in self.ordered_plugins() {
            if self.hook_allowed(&plugin.spec().id, HookKind::OnRouteError) {
                plugin.on_route_error(path, error).await;
            }
        }
    }

    fn recompute_order(&self) -> Result<(), XyPrissError> {
        let plugins = self.plugins.read();
        let order = compute_order(&plugins)?;
        drop(plugins);
        *self.order.write() = order;
        Ok(())
    }
}

/// Layered Kahn ordering: each round takes every plugin whose
/// dependencies are satisfied, sorted by (priority, registration).
/// Leftover nodes mean a cycle, which the DFS below extracts verbatim.
///
/// Dependencies dominate priority on purpose: a critical plugin that
/// depends on a low-priority one still runs after it.
fn compute_order(plugins: &HashMap<String, Registered>) -> Result<Vec<String>, XyPrissError> {
    // Unknown dependencies are reported before ordering.
    for (id, registered) in plugins.iter() {
        for dependency in &registered.plugin.spec().dependencies {
            if !plugins.contains_key(dependency) {
                return Err(XyPrissError::Plugin {
                    message: format!("plugin '{id}' depends on unknown plugin '{dependency}'"),
                });
            }
        }
    }

    let mut remaining: HashSet<&str> = plugins.keys().map(String::as_str).collect();
    let mut order = Vec::with_capacity(plugins.len());

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                plugins[*id]
                    .plugin
                    .spec()
                    .dependencies
                    .iter()
                    .all(|dep| !remaining.contains(dep.as_str()))
            })
            .collect();

        if ready.is_empty() {
            let cycle = find_cycle(plugins, &remaining);
            return Err(XyPrissError::PluginCycle { cycle });
        }

        ready.sort_by_key(|id| {
            let registered = &plugins[*id];
            (
                registered.plugin.spec().priority.rank(),
                registered.registration_index,
            )
        });
        for id in ready {
            remaining.remove(id);
            order.push(id.to_string());
        }
    }

    Ok(order)
}

/// Depth-first search over the stuck subgraph; returns one full cycle
/// with its closing vertex repeated, e.g. `[p1, p2, p3, p1]`.
fn find_cycle(plugins: &HashMap<String, Registered>, stuck: &HashSet<&str>) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        plugins: &'a HashMap<String, Registered>,
        stuck: &HashSet<&str>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for dependency in &plugins[node].plugin.spec().dependencies {
            let dependency = dependency.as_str();
            if !stuck.contains(dependency) {
                continue;
            }
            if on_stack.contains(dependency) {
                let start = stack.iter().position(|n| *n == dependency).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(dependency.to_string());
                return Some(cycle);
            }
            if !visited.contains(dependency) {
                let dependency_key = plugins
                    .get_key_value(dependency)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(dependency);
                if let Some(cycle) =
                    visit(dependency_key, plugins, stuck, visited, stack, on_stack)
                {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        None
    }

    let mut nodes: Vec<&str> = stuck.iter().copied().collect();
    nodes.sort_unstable();
    for node in nodes {
        if visited.contains(node) {
            continue;
        }
        let node_key = plugins
            .get_key_value(node)
            .map(|(k, _)| k.as_str())
            .unwrap_or(node);
        if let Some(cycle) = visit(
            node_key,
            plugins,
            stuck,
            &mut visited,
            &mut stack,
            &mut on_stack,
        ) {
            return cycle;
        }
    }
    stuck.iter().map(|n| n.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{ExecutionResult, PluginPriority, PluginSpec};

    struct TestPlugin {
        spec: PluginSpec,
    }

    #[async_trait::async_trait]
    impl XyPlugin for TestPlugin {
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
    }

    fn plugin(id: &str, deps: &[&str], priority: PluginPriority) -> Arc<dyn XyPlugin> {
        let mut spec = PluginSpec::new(id, id, "1.0.0").priority(priority);
        for dep in deps {
            spec = spec.depends_on(*dep);
        }
        Arc::new(TestPlugin { spec })
    }

    #[tokio::test]
    async fn dependencies_order_before_priority() {
        let registry = PluginRegistry::new(Vec::new());
        // low-priority dependency must still run before its dependent
        registry
            .register(plugin("base", &[], PluginPriority::Low), None)
            .await
            .unwrap();
        registry
            .register(plugin("top", &["base"], PluginPriority::Critical), None)
            .await
            .unwrap();
        registry.initialize().await.unwrap();
        assert_eq!(registry.execution_order(), vec!["base", "top"]);
    }

    #[tokio::test]
    async fn priority_orders_within_a_layer() {
        let registry = PluginRegistry::new(Vec::new());
        registry
            .register(plugin("slow", &[], PluginPriority::Low), None)
            .await
            .unwrap();
        registry
            .register(plugin("fast", &[], PluginPriority::Critical), None)
            .await
            .unwrap();
        registry
            .register(plugin("medium", &[], PluginPriority::Normal), None)
            .await
            .unwrap();
        registry.initialize().await.unwrap();
        assert_eq!(registry.execution_order(), vec!["fast", "medium", "slow"]);
    }

    #[tokio::test]
    async fn cycle_fails_initialize_naming_every_vertex() {
        let registry = PluginRegistry::new(Vec::new());
        registry
            .register(plugin("p1", &["p2"], PluginPriority::Normal), None)
            .await
            .unwrap();
        registry
            .register(plugin("p2", &["p3"], PluginPriority::Normal), None)
            .await
            .unwrap();
        registry
            .register(plugin("p3", &["p1"], PluginPriority::Normal), None)
            .await
            .unwrap();

        let error = registry.initialize().await.unwrap_err();
        match error {
            XyPrissError::PluginCycle { cycle } => {
                for id in ["p1", "p2", "p3"] {
                    assert!(cycle.iter().any(|c| c == id), "cycle missing {id}: {cycle:?}");
                }
            }
            other => panic!("expected PluginCycle, got {other}"),
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let registry = PluginRegistry::new(Vec::new());
        registry
            .register(plugin("dup", &[], PluginPriority::Normal), None)
            .await
            .unwrap();
        registry
            .register(plugin("dup", &[], PluginPriority::Normal), None)
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let registry = PluginRegistry::new(Vec::new());
        registry
            .register(plugin("lonely", &["ghost"], PluginPriority::Normal), None)
            .await
            .unwrap();
        assert!(registry.initialize().await.is_err());
    }

    #[tokio::test]
    async fn late_registration_lands_in_the_order() {
        let registry = PluginRegistry::new(Vec::new());
        registry
            .register(plugin("boot", &[], PluginPriority::Normal), None)
            .await
            .unwrap();
        registry.initialize().await.unwrap();

        registry
            .register(plugin("late", &["boot"], PluginPriority::Critical), None)
            .await
            .unwrap();
        assert_eq!(registry.execution_order(), vec!["boot", "late"]);
    }

    #[tokio::test]
    async fn permissions_gate_hooks_by_name() {
        let registry = PluginRegistry::new(vec![PluginPermissionSection {
            name: "restricted".to_string(),
            allowed_hooks: vec!["execute".to_string()],
        }]);
        registry
            .register(plugin("restricted", &[], PluginPriority::Normal), None)
            .await
            .unwrap();
        assert!(registry.hook_allowed("restricted", HookKind::Execute));
        assert!(!registry.hook_allowed("restricted", HookKind::OnRequest));
        // Unlisted plugins keep every hook.
        assert!(registry.hook_allowed("other", HookKind::OnRequest));
    }
}
