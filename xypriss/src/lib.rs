//! # XyPriss
//!
//! A high-throughput HTTP application framework with a programmable
//! request pipeline: pluggable middleware, dynamic routing,
//! response/connection optimization, reverse proxying with load
//! balancing, and a multi-process cluster supervisor with autoscaling.
//!
//! ## Architecture
//!
//! - **`plugins`**: the plugin registry and engine: dependency-ordered
//!   execution, priority scheduling, per-plugin circuit breakers,
//!   pooled execution contexts, result caching.
//! - **`network`**: the serving-side pipeline: connection pool with
//!   keep-alive policy, strict-allow-list compression, HTTP/2 push
//!   planning.
//! - **`security`**: the inspection chain: browser/terminal/mobile
//!   classifiers, injection detectors, and the XEMS encrypted session
//!   store with atomic token rotation.
//! - **`cluster`** and **`cpu_monitor`**: worker process supervision,
//!   cross-platform CPU sampling, and the autoscaling control loop.
//! - **`router`** / **`adapter`**: pattern routing with named params and
//!   the buffered request/response adapters user handlers see.
//! - **`config`**: typed configuration with deep-merge updates and
//!   immutability sealing.
//! - **`server`**: the assembly of all of the above behind an axum
//!   transport.
//!
//! ## Quick start
//!
//! ```rust
//! use xypriss::config::XyPrissConfig;
//! use xypriss::router::handler;
//! use xypriss::server::XyPrissServer;
//! use xypriss::adapter::XyResponse;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = XyPrissServer::build(XyPrissConfig::default()).await?;
//! server.get("/hello/:name", handler(|req| async move {
//!     let mut res = XyResponse::new();
//!     res.send(format!("hello {}", req.param("name").unwrap_or("world")));
//!     Ok(res)
//! }))?;
//! server.serve().await
//! # }
//! ```

pub mod adapter;
pub mod admin;
pub mod cluster;
pub mod config;
pub mod cpu_monitor;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod plugins;
pub mod router;
pub mod security;
pub mod server;

pub use adapter::{XyRequest, XyResponse};
pub use config::{ConfigManager, XyPrissConfig};
pub use error::XyPrissError;
pub use server::XyPrissServer;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    #[tokio::test]
    async fn health_endpoint_answers_the_contract() {
        let server = XyPrissServer::build(XyPrissConfig::default()).await.unwrap();
        server.state().registry.initialize().await.unwrap();
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert!(body["metrics"]["responseTime"].is_number());
        assert!(body["metrics"]["errorRate"].is_number());
        assert!(body["metrics"]["throughput"].is_number());
        assert!(body["metrics"]["connections"].is_number());
        assert!(body["lastCheck"].is_string());
    }

    #[tokio::test]
    async fn unknown_routes_return_the_error_envelope() {
        let server = XyPrissServer::build(XyPrissConfig::default()).await.unwrap();
        server.state().registry.initialize().await.unwrap();
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/nope").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["code"], "XYP_NOT_FOUND");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn registered_routes_dispatch_with_params() {
        let server = XyPrissServer::build(XyPrissConfig::default()).await.unwrap();
        server
            .get(
                "/greet/:name",
                router::handler(|req| async move {
                    let mut res = XyResponse::new();
                    res.send(format!("hi {}", req.param("name").unwrap_or("?")));
                    Ok(res)
                }),
            )
            .unwrap();
        server.state().registry.initialize().await.unwrap();
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/greet/ada").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), "hi ada");
    }
}
