//! Admin surface: operator-facing read-only endpoints.
//!
//! - `GET /admin/plugins`: registered plugins with their computed
//!   execution order and engine health (failure counts, breaker states,
//!   context-pool statistics).
//! - `GET /admin/upstreams`: per-route upstream health, in-flight usage,
//!   and latency averages.
//! - `GET /admin/config`: the live configuration tree with secrets
//!   redacted.
//!
//! Everything here is a snapshot read; mutation stays with the
//! configuration manager and the plugin registry.

use crate::server::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

/// The admin sub-router, merged into the main application.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/plugins", get(list_plugins))
        .route("/admin/upstreams", get(list_upstreams))
        .route("/admin/config", get(show_config))
}

async fn list_plugins(State(state): State<AppState>) -> Response {
    let plugins: Vec<Value> = state
        .registry
        .ordered_plugins()
        .iter()
        .map(|plugin| {
            let spec = plugin.spec();
            json!({
                "id": spec.id,
                "name": spec.name,
                "version": spec.version,
                "category": spec.category,
                "priority": spec.priority,
                "dependencies": spec.dependencies,
                "cacheable": spec.cacheable,
            })
        })
        .collect();

    Json(json!({
        "executionOrder": state.registry.execution_order(),
        "plugins": plugins,
        "engine": state.engine.health().await,
    }))
    .into_response()
}

async fn list_upstreams(State(state): State<AppState>) -> Response {
    let routes: Vec<Value> = state
        .proxy_routes
        .iter()
        .map(|route| {
            let upstreams: Vec<Value> = route
                .pool
                .all()
                .iter()
                .map(|upstream| {
                    json!({
                        "key": upstream.key(),
                        "weight": upstream.upstream.weight,
                        "healthy": upstream.is_healthy(),
                        "activeRequests": upstream.active_requests(),
                        "totalRequests": upstream.total_requests(),
                        "failedRequests": upstream.failed_requests(),
                        "averageLatencyMs": upstream.average_latency_ms(),
                    })
                })
                .collect();
            json!({
                "prefix": route.prefix,
                "healthyCount": route.pool.healthy_count(),
                "upstreams": upstreams,
            })
        })
        .collect();

    Json(json!({ "routes": routes })).into_response()
}

async fn show_config(State(state): State<AppState>) -> Response {
    let mut tree = state.config.tree();
    redact_secrets(&mut tree);
    Json(tree).into_response()
}

/// Blank out anything secret-shaped before it leaves the process.
fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if lowered.contains("secret")
                    || lowered.contains("password")
                    || lowered.contains("apikey")
                {
                    if !child.is_null() {
                        *child = Value::String("***".to_string());
                    }
                } else {
                    redact_secrets(child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XyPrissConfig;
    use crate::server::XyPrissServer;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    #[test]
    fn redaction_blanks_secret_keys_recursively() {
        let mut tree = json!({
            "xems": {"secret": "super-sensitive", "cookieName": "xems_token"},
            "nested": [{"apiKey": "k"}],
            "empty": {"secret": null},
        });
        redact_secrets(&mut tree);
        assert_eq!(tree["xems"]["secret"], "***");
        assert_eq!(tree["xems"]["cookieName"], "xems_token");
        assert_eq!(tree["nested"][0]["apiKey"], "***");
        assert!(tree["empty"]["secret"].is_null());
    }

    #[tokio::test]
    async fn admin_config_never_leaks_the_xems_secret() {
        let mut config = XyPrissConfig::default();
        config.xems.enabled = true;
        config.xems.secret = Some("ef".repeat(32));

        let server = XyPrissServer::build(config).await.unwrap();
        server.state().registry.initialize().await.unwrap();
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/admin/config").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert_eq!(body["xems"]["secret"], "***");
        assert_eq!(body["server"]["port"], 8080);
    }

    #[tokio::test]
    async fn admin_plugins_reports_order_and_engine_health() {
        let server = XyPrissServer::build(XyPrissConfig::default()).await.unwrap();
        server.state().registry.initialize().await.unwrap();
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/admin/plugins").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert!(body["executionOrder"].is_array());
        assert!(body["engine"]["contextPool"].is_object());
    }
}
