//! Connection plugin: the per-endpoint connection pool.
//!
//! A connection record is keyed by `remote_address:remote_port` and lives
//! from the first request of that endpoint until eviction. On every
//! request the manager bumps the record (`last_used`, `request_count`) and
//! hands back the headers to apply: `Connection` / `Keep-Alive` on new
//! connections, plus an `Alt-Svc` HTTP/2 hint when enabled and the client
//! arrived over HTTP/1.1.
//!
//! The whole pool sits behind a single mutex; each operation is O(1)-ish
//! and the background sweep runs under the same lock, so record state
//! never tears. Eviction fires when a record idles past `max_idle_time`,
//! reaches `max_requests_per_connection`, or the pool needs room for a
//! newcomer (oldest-idle first).

use crate::config::ConnectionSection;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One tracked connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub remote_address: String,
    pub protocol: String,
    pub encrypted: bool,
    pub created: Instant,
    pub last_used: Instant,
    pub request_count: u64,
    pub keep_alive: bool,
    pub http2: bool,
    pub max_requests: u64,
    pub timeout: Duration,
}

/// What the pipeline applies to the response after a touch.
#[derive(Debug)]
pub struct ConnectionTouch {
    pub connection_id: String,
    pub reused: bool,
    /// Headers the connection plugin asks the response to carry
    pub headers: Vec<(String, String)>,
}

/// Pool counters for health reporting.
#[derive(Debug, Default, Serialize)]
pub struct ConnectionStats {
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
}

struct PoolInner {
    connections: HashMap<String, Connection>,
}

/// The connection pool manager.
pub struct ConnectionManager {
    inner: Mutex<PoolInner>,
    config: ConnectionSection,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: ConnectionSection) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                connections: HashMap::new(),
            }),
            config,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Record a request from `remote`, creating or bumping its record.
    pub fn touch(&self, remote: SocketAddr, http2: bool, encrypted: bool) -> ConnectionTouch {
        let key = remote.to_string();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(connection) = inner.connections.get_mut(&key) {
            connection.last_used = now;
            connection.request_count += 1;
            self.reused.fetch_add(1, Ordering::Relaxed);

            let expired = connection.request_count >= connection.max_requests;
            let touch = ConnectionTouch {
                connection_id: connection.id.clone(),
                reused: true,
                // Reused connections already negotiated keep-alive.
                headers: if expired {
                    vec![("connection".to_string(), "close".to_string())]
                } else {
                    Vec::new()
                },
            };
            if expired {
                let id = connection.id.clone();
                inner.connections.remove(&key);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(connection = %id, "connection reached request cap, evicted");
            }
            return touch;
        }

        // Room must exist before inserting; evict the oldest-idle record.
        if inner.connections.len() >= self.config.max_connections {
            if let Some(oldest) = inner
                .connections
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.connections.remove(&oldest);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %oldest, "pool full, evicted oldest-idle connection");
            }
        }

        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            remote_address: remote.ip().to_string(),
            protocol: if http2 { "h2" } else { "http/1.1" }.to_string(),
            encrypted,
            created: now,
            last_used: now,
            request_count: 1,
            keep_alive: self.config.keep_alive,
            http2,
            max_requests: self.config.max_requests_per_connection,
            timeout: self.config.keep_alive_timeout,
        };
        let touch = ConnectionTouch {
            connection_id: connection.id.clone(),
            reused: false,
            headers: self.new_connection_headers(http2),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        inner.connections.insert(key, connection);
        touch
    }

    fn new_connection_headers(&self, http2: bool) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if self.config.keep_alive && !http2 {
            headers.push(("connection".to_string(), "keep-alive".to_string()));
            headers.push((
                "keep-alive".to_string(),
                format!(
                    "timeout={}, max={}",
                    self.config.keep_alive_timeout.as_secs(),
                    self.config.max_requests_per_connection
                ),
            ));
        }
        if self.config.http2_hints && !http2 {
            headers.push(("alt-svc".to_string(), "h2=\":443\"; ma=3600".to_string()));
        }
        headers
    }

    /// Evict idle and exhausted records; returns how many went.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let max_idle = self.config.max_idle_time;
        let before = inner.connections.len();
        inner
            .connections
            .retain(|_, c| c.last_used.elapsed() <= max_idle && c.request_count < c.max_requests);
        let evicted = before - inner.connections.len();
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "connection sweep evicted idle records");
        }
        evicted
    }

    /// Spawn the periodic sweeper. The cadence follows `max_idle_time`
    /// so a record overstays by at most one interval.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.max_idle_time.min(Duration::from_secs(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    pub fn get(&self, remote: &SocketAddr) -> Option<Connection> {
        self.inner.lock().connections.get(&remote.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
