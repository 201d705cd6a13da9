//! # Dynamic Router
//!
//! Path patterns compile to segment matchers with named `:param`
//! placeholders and a trailing `*` wildcard that captures any suffix.
//! Matching is case-sensitive. When several routes match one path,
//! precedence is exact > parameterized > wildcard, and routes of equal
//! precedence win by registration order.
//!
//! The router is read-mostly: plugins may register routes after boot, so
//! the table sits behind a lightweight write lock.

use crate::adapter::{XyRequest, XyResponse};
use crate::error::XyPrissError;
use axum::http::Method;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Future returned by route handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<XyResponse, XyPrissError>> + Send>>;

/// A route handler: takes the adapted request, returns a buffered response.
pub type RouteHandler = Arc<dyn Fn(XyRequest) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`RouteHandler`].
pub fn handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(XyRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<XyResponse, XyPrissError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// Match specificity, lowest rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PatternKind {
    Exact = 0,
    Parameterized = 1,
    Wildcard = 2,
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
    kind: PatternKind,
}

impl RoutePattern {
    /// Compile a pattern such as `/users/:id/files/*`.
    ///
    /// `:name` segments capture one path segment; a trailing `*` captures
    /// the remaining suffix under the parameter name `*`. A `*` anywhere
    /// but last is rejected.
    pub fn compile(pattern: &str) -> Result<Self, XyPrissError> {
        if !pattern.starts_with('/') {
            return Err(XyPrissError::Plugin {
                message: format!("route pattern must start with '/': {pattern}"),
            });
        }

        let parts: Vec<&str> = pattern.trim_start_matches('/').split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut has_param = false;
        let mut has_wildcard = false;

        for (index, part) in parts.iter().enumerate() {
            if *part == "*" {
                if index != parts.len() - 1 {
                    return Err(XyPrissError::Plugin {
                        message: format!("wildcard must be the final segment: {pattern}"),
                    });
                }
                has_wildcard = true;
                segments.push(Segment::Wildcard);
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(XyPrissError::Plugin {
                        message: format!("unnamed parameter in pattern: {pattern}"),
                    });
                }
                has_param = true;
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        let kind = if has_wildcard {
            PatternKind::Wildcard
        } else if has_param {
            PatternKind::Parameterized
        } else {
            PatternKind::Exact
        };

        Ok(Self {
            raw: pattern.to_string(),
            segments,
            kind,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a path, returning captured parameters on success. The
    /// wildcard suffix, when present, lands under the `*` key.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut params = HashMap::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(expected) => {
                    if parts.get(index) != Some(&expected.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index)?;
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
                Segment::Wildcard => {
                    let suffix = parts.get(index..).map(|s| s.join("/")).unwrap_or_default();
                    params.insert("*".to_string(), suffix);
                    return Some(params);
                }
            }
        }

        if parts.len() == self.segments.len() {
            Some(params)
        } else {
            None
        }
    }
}

struct Route {
    method: Method,
    pattern: RoutePattern,
    handler: RouteHandler,
    order: usize,
}

/// A successful route lookup.
pub struct RouteMatch {
    pub handler: RouteHandler,
    pub params: HashMap<String, String>,
    pub pattern: String,
}

/// Method-aware route table.
pub struct XyRouter {
    routes: RwLock<Vec<Route>>,
    counter: AtomicUsize,
}

impl Default for XyRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl XyRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Register a route. `Method` semantics are exact; `add_any` matches
    /// every method.
    pub fn add(
        &self,
        method: Method,
        pattern: &str,
        handler: RouteHandler,
    ) -> Result<(), XyPrissError> {
        let pattern = RoutePattern::compile(pattern)?;
        let order = self.counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(method = %method, pattern = %pattern.raw(), "route registered");
        self.routes.write().push(Route {
            method,
            pattern,
            handler,
            order,
        });
        Ok(())
    }

    pub fn add_any(&self, pattern: &str, handler: RouteHandler) -> Result<(), XyPrissError> {
        // A dedicated sentinel method would leak into match logic; the
        // CONNECT method never reaches the router, so it serves as "any".
        self.add(Method::CONNECT, pattern, handler)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Find the best route for `method path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.read();
        let mut best: Option<(&Route, HashMap<String, String>)> = None;

        for route in routes.iter() {
            if route.method != *method && route.method != Method::CONNECT {
                continue;
            }
            if let Some(params) = route.pattern.matches(path) {
                let better = match &best {
                    None => true,
                    Some((current, _)) => {
                        (route.pattern.kind, route.order) < (current.pattern.kind, current.order)
                    }
                };
                if better {
                    best = Some((route, params));
                }
            }
        }

        best.map(|(route, params)| RouteMatch {
            handler: Arc::clone(&route.handler),
            params,
            pattern: route.pattern.raw.clone(),
        })
    }
}
