//! Connection plugin annotations on the wire.

use axum::http::StatusCode;
use axum_test::TestServer;
use xypriss::adapter::XyResponse;
use xypriss::config::XyPrissConfig;
use xypriss::router::handler;
use xypriss::server::XyPrissServer;

async fn plain_server() -> TestServer {
    let server = XyPrissServer::build(XyPrissConfig::default()).await.unwrap();
    server
        .get(
            "/",
            handler(|_req| async move {
                let mut res = XyResponse::new();
                res.send("ok");
                Ok(res)
            }),
        )
        .unwrap();
    server.state().registry.initialize().await.unwrap();
    TestServer::new(server.app()).unwrap()
}

#[tokio::test]
async fn first_response_carries_keep_alive_headers() {
    let client = plain_server().await;
    let response = client.get("/").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers().get("connection").unwrap(), "keep-alive");

    let keep_alive = response
        .headers()
        .get("keep-alive")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(keep_alive.contains("timeout="));
    assert!(keep_alive.contains("max="));
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let client = plain_server().await;
    let first = client.get("/").await;
    let second = client.get("/").await;

    let id_a = first
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let id_b = second
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(id_a, id_b);
    assert!(!id_a.is_empty());
}

#[tokio::test]
async fn reused_connections_skip_the_negotiation_headers() {
    let client = plain_server().await;
    // The test transport presents one peer address, so the second
    // request reuses the first request's connection record.
    let _first = client.get("/").await;
    let second = client.get("/").await;
    assert!(second.headers().get("connection").is_none());
}
