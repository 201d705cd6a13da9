//! Pooled per-request execution contexts.
//!
//! One [`ExecutionContext`] travels with each request through the
//! middleware chain and the plugin engine. Contexts are pooled: acquired
//! when a request enters the pipeline, reset and returned on finalize, so
//! the hot path does not allocate a fresh record per request.
//!
//! Request-scoped state lives here and only here; plugins communicate
//! through the typed payload map, never through globals.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Authentication state carried through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub is_authenticated: bool,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Pipeline timing marks.
#[derive(Debug, Clone)]
pub struct TimingContext {
    pub accept_time: Instant,
    pub pipeline_start: Instant,
}

impl Default for TimingContext {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            accept_time: now,
            pipeline_start: now,
        }
    }
}

/// Transport-level facts about the connection serving this request.
#[derive(Debug, Clone, Default)]
pub struct NetworkContext {
    pub remote_addr: String,
    pub remote_port: u16,
    pub local_addr: String,
    pub local_port: u16,
    pub encrypted: bool,
    pub protocol: String,
}

/// Per-request record handed to every plugin hook.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    pub request_id: String,
    pub security: SecurityContext,
    pub timing: TimingContext,
    pub network: NetworkContext,
    /// Plugin payloads keyed by plugin id
    payloads: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn set_payload(&mut self, plugin_id: &str, value: serde_json::Value) {
        self.payloads.insert(plugin_id.to_string(), value);
    }

    pub fn payload(&self, plugin_id: &str) -> Option<&serde_json::Value> {
        self.payloads.get(plugin_id)
    }

    /// Wipe request-scoped state before the context returns to the pool.
    fn reset(&mut self) {
        self.request_id.clear();
        self.security = SecurityContext::default();
        self.timing = TimingContext::default();
        self.network = NetworkContext::default();
        self.payloads.clear();
    }

    fn prepare(&mut self, request_id: String, network: NetworkContext) {
        let now = Instant::now();
        self.request_id = request_id;
        self.network = network;
        self.timing = TimingContext {
            accept_time: now,
            pipeline_start: now,
        };
    }
}

/// Pool statistics, exposed through the engine health report.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub reused: u64,
    pub allocated: u64,
    pub idle: usize,
}

/// Fixed-capacity free list of execution contexts.
pub struct ContextPool {
    free: Mutex<Vec<Box<ExecutionContext>>>,
    capacity: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    /// Take a context for a new request, reusing a pooled record when one
    /// is free.
    pub fn acquire(&self, request_id: String, network: NetworkContext) -> Box<ExecutionContext> {
        let pooled = self.free.lock().pop();
        let mut ctx = match pooled {
            Some(ctx) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                ctx
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        };
        ctx.prepare(request_id, network);
        ctx
    }

    /// Return a context after finalize. Beyond capacity the record is
    /// simply dropped.
    pub fn release(&self, mut ctx: Box<ExecutionContext>) {
        ctx.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reused: self.reused.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}
