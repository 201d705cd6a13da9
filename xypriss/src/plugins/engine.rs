//! # Plugin Execution Engine
//!
//! This module provides the hot-path plugin executor for the XyPriss
//! pipeline. For every request the engine walks the registry's execution
//! order and runs each plugin's `execute` stage with bounded latency and
//! isolated failures.
//!
//! ## Overview
//!
//! The engine wraps each plugin invocation in a stack of protections:
//!
//! - **Circuit Breaker**: each plugin owns a breaker; a plugin that keeps
//!   failing is short-circuited after enough failures inside its window
//!   and retried after the cooldown. While the breaker is open, the
//!   plugin is simply skipped and the chain continues.
//! - **Execution Deadline**: `max_execution_time` bounds a single
//!   `execute` call. A budget of zero means no budget at all; such a
//!   plugin never times out.
//! - **Result Cache**: cacheable plugins consult an LRU cache keyed by a
//!   SHA-256 fingerprint of the request fields they declared in
//!   `cache_fields`. A fresh hit skips execution entirely.
//! - **Panic Boundary**: a panicking plugin degrades into a recorded
//!   failure instead of tearing the worker down.
//! - **Context Pool**: per-request execution contexts are acquired from a
//!   fixed-capacity pool and returned on finalize, keeping the hot path
//!   free of per-request allocation.
//!
//! ## Halt Semantics
//!
//! A plugin *failure* (error, deadline overrun, panic) never aborts the
//! chain: the breaker records it and the remaining plugins still run. A
//! plugin *halt* is different: any plugin that returns
//! `should_continue = false` stops the chain immediately, regardless of
//! its priority, and the pipeline answers with the plugin's response
//! data. Critical-priority plugins are the expected users of this
//! escape hatch; a non-critical plugin halting the chain is honored but
//! logged as unusual.
//!
//! ## Usage
//!
//! ```rust
//! use xypriss::plugins::engine::{EngineConfig, PluginEngine};
//! use xypriss::plugins::context::NetworkContext;
//! use xypriss::plugins::registry::PluginRegistry;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(PluginRegistry::new(Vec::new()));
//! // ... register plugins, then:
//! registry.initialize().await?;
//!
//! let engine = PluginEngine::new(Arc::clone(&registry), EngineConfig::default());
//!
//! // Per request:
//! let mut ctx = engine.acquire_context(request_id, NetworkContext::default());
//! let outcome = engine.run(&mut ctx, &mut request).await;
//! if outcome.halted {
//!     // Answer with outcome.halt_data and stop.
//! }
//! engine.release_context(ctx);
//! ```
//!
//! ## Performance Considerations
//!
//! - **Snapshot reads**: the plugin list is snapshotted per request; no
//!   registry lock is held across an `await`.
//! - **Cheap skips**: an open breaker or a cache hit costs one map
//!   lookup, not a plugin call.
//! - **Bounded memory**: the result cache is LRU-bounded and entries
//!   expire after the configured TTL; the context pool is capped.

use super::context::{ContextPool, ExecutionContext, NetworkContext, PoolStats};
use super::registry::PluginRegistry;
use super::{CacheField, ExecutionResult, HookKind, PluginPriority, XyPlugin};
use crate::adapter::XyRequest;
use crate::error::XyPrissError;
use dashmap::DashMap;
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xypriss_net::{BreakerConfig, CircuitBreaker};

/// Engine tuning, derived from the `cache` and `plugins` config
/// sections.
///
/// # Examples
///
/// ```rust
/// use xypriss::plugins::engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     context_pool_size: 512,
///     cache_ttl: Duration::from_secs(30),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Execution contexts kept on the free list
    pub context_pool_size: usize,
    /// Whether cacheable plugins may consult the result cache
    pub cache_enabled: bool,
    /// Maximum entries in the result cache
    pub cache_max_entries: usize,
    /// How long a cached result stays fresh
    pub cache_ttl: Duration,
    /// Breaker defaults for plugins without their own tuning
    pub default_breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_pool_size: 256,
            cache_enabled: true,
            cache_max_entries: 1_000,
            cache_ttl: Duration::from_secs(60),
            default_breaker: BreakerConfig::default(),
        }
    }
}

struct CachedResult {
    result: ExecutionResult,
    stored_at: Instant,
}

/// Outcome of running the whole chain for one request.
///
/// The pipeline folds the per-plugin [`ExecutionResult`]s into this
/// record: header modifications accumulate across the chain, and the
/// first plugin to signal a halt stops the walk and carries its data
/// payload here.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    /// A plugin halted the chain
    pub halted: bool,
    /// Data supplied by the halting plugin, if any
    pub halt_data: Option<serde_json::Value>,
    /// Header modifications collected across the chain
    pub headers: Vec<(String, String)>,
}

/// The plugin executor.
///
/// One engine lives per worker and is shared across all of that
/// worker's requests. It owns the context pool, the per-plugin circuit
/// breakers, the result cache, and the per-plugin failure counters that
/// feed the health report.
///
/// # Thread Safety
///
/// All interior state is either atomic, sharded (`DashMap`), or behind
/// short-lived locks; the engine itself is shared as an `Arc`.
pub struct PluginEngine {
    registry: Arc<PluginRegistry>,
    pool: ContextPool,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    cache: Mutex<LruCache<String, CachedResult>>,
    config: EngineConfig,
    failures: DashMap<String, u64>,
}

impl PluginEngine {
    /// Create an engine over an initialized (or soon-initialized)
    /// registry.
    ///
    /// # Arguments
    ///
    /// * `registry` - The plugin registry whose execution order drives
    ///   the per-request walk
    /// * `config` - Pool, cache, and breaker tuning
    pub fn new(registry: Arc<PluginRegistry>, config: EngineConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            registry,
            pool: ContextPool::new(config.context_pool_size),
            breakers: DashMap::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            config,
            failures: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Take a pooled execution context for a new request.
    ///
    /// The context must be handed back through
    /// [`release_context`](Self::release_context) when the request
    /// finalizes, on every exit path, or the pool slowly drains to
    /// fresh allocations.
    pub fn acquire_context(
        &self,
        request_id: String,
        network: NetworkContext,
    ) -> Box<ExecutionContext> {
        self.pool.acquire(request_id, network)
    }

    /// Return a context to the pool after finalize.
    pub fn release_context(&self, ctx: Box<ExecutionContext>) {
        self.pool.release(ctx)
    }

    /// Run the `execute` stage of every plugin in registry order.
    ///
    /// Failures are isolated per plugin: an error, deadline overrun, or
    /// panic records a breaker failure and the walk continues. A plugin
    /// returning `should_continue = false` halts the walk for any
    /// priority; see the module documentation for the full semantics.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The request's pooled execution context
    /// * `req` - The adapted request, which plugins may mutate
    ///
    /// # Returns
    ///
    /// The folded [`EngineOutcome`]: collected header modifications plus
    /// the halt flag and halt payload when a plugin stopped the chain.
    pub async fn run(&self, ctx: &mut ExecutionContext, req: &mut XyRequest) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();

        for plugin in self.registry.ordered_plugins() {
            let spec = plugin.spec().clone();
            if !self.registry.hook_allowed(&spec.id, HookKind::Execute) {
                continue;
            }

            let breaker = self.breaker_for(&spec.id, spec.breaker.clone());
            if !breaker.try_acquire().await {
                tracing::debug!(plugin = %spec.id, "breaker open, skipping plugin");
                continue;
            }

            // Cache consult before paying for execution.
            let cache_key = if spec.cacheable && self.config.cache_enabled {
                let key = fingerprint(&spec.id, &spec.cache_fields, req);
                if let Some(result) = self.cache_lookup(&key) {
                    breaker.record_success().await;
                    if self.fold(&spec.id, spec.priority, result, &mut outcome) {
                        return outcome;
                    }
                    continue;
                }
                Some(key)
            } else {
                None
            };

            let started = Instant::now();
            let result = self.execute_guarded(&plugin, &spec.max_execution_time, ctx, req).await;
            let elapsed = started.elapsed();

            match result {
                Ok(mut result) => {
                    result.execution_time_ms = elapsed.as_millis() as u64;
                    breaker.record_success().await;
                    if let Some(key) = cache_key {
                        self.cache_store(key, &result);
                    }
                    if self.fold(&spec.id, spec.priority, result, &mut outcome) {
                        return outcome;
                    }
                }
                Err(error) => {
                    breaker.record_failure().await;
                    *self.failures.entry(spec.id.clone()).or_insert(0) += 1;
                    tracing::error!(
                        plugin = %spec.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        %error,
                        "plugin execute failed, chain continues"
                    );
                }
            }
        }

        outcome
    }

    /// Execute with deadline and panic boundary.
    async fn execute_guarded(
        &self,
        plugin: &Arc<dyn XyPlugin>,
        budget: &Duration,
        ctx: &mut ExecutionContext,
        req: &mut XyRequest,
    ) -> Result<ExecutionResult, XyPrissError> {
        let work = std::panic::AssertUnwindSafe(plugin.execute(ctx, req)).catch_unwind();
        let outcome = if budget.is_zero() {
            // Zero budget means no budget at all.
            work.await
        } else {
            match tokio::time::timeout(*budget, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(XyPrissError::Plugin {
                        message: format!("execution exceeded budget of {budget:?}"),
                    })
                }
            }
        };

        match outcome {
            Ok(result) => result,
            Err(_panic) => Err(XyPrissError::Plugin {
                message: "plugin panicked during execute".to_string(),
            }),
        }
    }

    /// Merge a result into the outcome; returns whether the chain halts.
    fn fold(
        &self,
        plugin_id: &str,
        priority: PluginPriority,
        result: ExecutionResult,
        outcome: &mut EngineOutcome,
    ) -> bool {
        outcome.headers.extend(result.headers.iter().cloned());

        if !result.should_continue {
            // Any priority may halt; non-critical halts are unusual
            // enough to flag.
            if priority != PluginPriority::Critical {
                tracing::warn!(plugin = %plugin_id, "non-critical plugin halted the chain");
            }
            outcome.halted = true;
            outcome.halt_data = result.data;
            return true;
        }
        false
    }

    fn breaker_for(&self, plugin_id: &str, custom: Option<BreakerConfig>) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(plugin_id.to_string())
            .or_insert_with(|| {
                let config = custom.unwrap_or_else(|| self.config.default_breaker.clone());
                Arc::new(CircuitBreaker::new(plugin_id, config))
            })
            .clone()
    }

    fn cache_lookup(&self, key: &str) -> Option<ExecutionResult> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.config.cache_ttl => {
                Some(entry.result.clone())
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, key: String, result: &ExecutionResult) {
        self.cache.lock().put(
            key,
            CachedResult {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Health view surfaced through `/metrics` and `/admin/plugins`.
    ///
    /// # Returns
    ///
    /// A JSON object with per-plugin failure counts, the state of every
    /// circuit breaker, and context-pool statistics.
    pub async fn health(&self) -> serde_json::Value {
        let mut breakers = Vec::new();
        for entry in self.breakers.iter() {
            breakers.push(entry.value().metrics().await);
        }
        let failures: std::collections::HashMap<String, u64> = self
            .failures
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        json!({
            "failures": failures,
            "breakers": breakers,
            "contextPool": self.pool_stats(),
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// SHA-256 fingerprint over the request fields a plugin declared.
///
/// Query pairs are folded in sorted order so two requests with the same
/// parameters in different order share one cache entry.
fn fingerprint(plugin_id: &str, fields: &[CacheField], req: &XyRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plugin_id.as_bytes());
    for field in fields {
        hasher.update([0u8]);
        match field {
            CacheField::Method => hasher.update(req.method.as_str().as_bytes()),
            CacheField::Path => hasher.update(req.path.as_bytes()),
            CacheField::Query => {
                let mut pairs: Vec<(&String, &String)> = req.query.iter().collect();
                pairs.sort();
                for (key, value) in pairs {
                    hasher.update(key.as_bytes());
                    hasher.update([b'=']);
                    hasher.update(value.as_bytes());
                    hasher.update([b'&']);
                }
            }
            CacheField::Header(name) => {
                hasher.update(name.as_bytes());
                hasher.update([b':']);
                hasher.update(req.header(name).unwrap_or("").as_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginSpec;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn request() -> XyRequest {
        XyRequest::adapt(
            Method::GET,
            "/cached?b=2&a=1".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:9999".parse().unwrap(),
            false,
            false,
            false,
        )
    }

    struct CountingPlugin {
        spec: PluginSpec,
        calls: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl XyPlugin for CountingPlugin {
        fn spec(&self) -> &PluginSpec {
            &self.spec
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _req: &mut XyRequest,
        ) -> Result<ExecutionResult, XyPrissError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(XyPrissError::Plugin {
                    message: "intentional".to_string(),
                })
            } else {
                Ok(ExecutionResult::ok().with_header("x-counted", "yes"))
            }
        }
    }

    async fn engine_with(plugin: Arc<dyn XyPlugin>) -> PluginEngine {
        let registry = Arc::new(PluginRegistry::new(Vec::new()));
        registry.register(plugin, None).await.unwrap();
        registry.initialize().await.unwrap();
        PluginEngine::new(registry, EngineConfig::default())
    }

    #[tokio::test]
    async fn cacheable_plugin_executes_once_per_fingerprint() {
        let calls = Arc::new(AtomicU64::new(0));
        let spec = PluginSpec::new("cached", "cached", "1.0.0")
            .cacheable(vec![CacheField::Method, CacheField::Path, CacheField::Query]);
        let engine = engine_with(Arc::new(CountingPlugin {
            spec,
            calls: Arc::clone(&calls),
            fail: false,
        }))
        .await;

        let mut ctx = engine.acquire_context("r1".into(), NetworkContext::default());
        let mut req = request();
        let outcome = engine.run(&mut ctx, &mut req).await;
        assert!(outcome.headers.iter().any(|(n, _)| n == "x-counted"));

        let mut req = request();
        engine.run(&mut ctx, &mut req).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.release_context(ctx);
    }

    #[tokio::test]
    async fn failures_are_isolated_and_counted() {
        let calls = Arc::new(AtomicU64::new(0));
        let spec = PluginSpec::new("flaky", "flaky", "1.0.0");
        let engine = engine_with(Arc::new(CountingPlugin {
            spec,
            calls,
            fail: true,
        }))
        .await;

        let mut ctx = engine.acquire_context("r1".into(), NetworkContext::default());
        let mut req = request();
        let outcome = engine.run(&mut ctx, &mut req).await;
        assert!(!outcome.halted);

        let health = engine.health().await;
        assert_eq!(health["failures"]["flaky"], 1);
        engine.release_context(ctx);
    }

    struct SlowPlugin {
        spec: PluginSpec,
    }

    #[async_trait::async_trait]
    impl XyPlugin for SlowPlugin {
        fn spec(&self) -> &PluginSpec {
            &self.spec
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _req: &mut XyRequest,
        ) -> Result<ExecutionResult, XyPrissError> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(ExecutionResult::ok())
        }
    }

    #[tokio::test]
    async fn budget_overrun_counts_as_failure() {
        let spec =
            PluginSpec::new("slow", "slow", "1.0.0").execution_budget(Duration::from_millis(10));
        let engine = engine_with(Arc::new(SlowPlugin { spec })).await;

        let mut ctx = engine.acquire_context("r1".into(), NetworkContext::default());
        let mut req = request();
        engine.run(&mut ctx, &mut req).await;
        let health = engine.health().await;
        assert_eq!(health["failures"]["slow"], 1);
        engine.release_context(ctx);
    }

    #[tokio::test]
    async fn zero_budget_never_times_out() {
        let spec = PluginSpec::new("slow", "slow", "1.0.0").execution_budget(Duration::ZERO);
        let engine = engine_with(Arc::new(SlowPlugin { spec })).await;

        let mut ctx = engine.acquire_context("r1".into(), NetworkContext::default());
        let mut req = request();
        engine.run(&mut ctx, &mut req).await;
        let health = engine.health().await;
        assert!(health["failures"].get("slow").is_none());
        engine.release_context(ctx);
    }

    struct HaltingPlugin {
        spec: PluginSpec,
    }

    #[async_trait::async_trait]
    impl XyPlugin for HaltingPlugin {
        fn spec(&self) -> &PluginSpec {
            &self.spec
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _req: &mut XyRequest,
        ) -> Result<ExecutionResult, XyPrissError> {
            Ok(ExecutionResult::halt().with_data(json!({"reason": "blocked"})))
        }
    }

    #[tokio::test]
    async fn critical_halt_stops_the_chain() {
        let registry = Arc::new(PluginRegistry::new(Vec::new()));
        let halting = PluginSpec::new("gate", "gate", "1.0.0").priority(PluginPriority::Critical);
        registry
            .register(Arc::new(HaltingPlugin { spec: halting }), None)
            .await
            .unwrap();
        let counted = Arc::new(AtomicU64::new(0));
        let downstream = PluginSpec::new("after", "after", "1.0.0")
            .priority(PluginPriority::Low);
        registry
            .register(
                Arc::new(CountingPlugin {
                    spec: downstream,
                    calls: Arc::clone(&counted),
                    fail: false,
                }),
                None,
            )
            .await
            .unwrap();
        registry.initialize().await.unwrap();

        let engine = PluginEngine::new(registry, EngineConfig::default());
        let mut ctx = engine.acquire_context("r1".into(), NetworkContext::default());
        let mut req = request();
        let outcome = engine.run(&mut ctx, &mut req).await;

        assert!(outcome.halted);
        assert_eq!(outcome.halt_data, Some(json!({"reason": "blocked"})));
        assert_eq!(counted.load(Ordering::SeqCst), 0);
        engine.release_context(ctx);
    }

    #[test]
    fn fingerprint_is_stable_under_query_reordering() {
        let req_a = request();
        let mut req_b = request();
        // Same pairs, different insertion history.
        req_b.query.clear();
        req_b.query.insert("a".into(), "1".into());
        req_b.query.insert("b".into(), "2".into());

        let fields = vec![CacheField::Method, CacheField::Path, CacheField::Query];
        assert_eq!(
            fingerprint("p", &fields, &req_a),
            fingerprint("p", &fields, &req_b)
        );
    }
}
