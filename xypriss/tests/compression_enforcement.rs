//! End-to-end compression allow-list enforcement.
//!
//! The configuration allows brotli and deflate only. A client accepting
//! gzip, deflate, and brotli gets brotli (highest preference among the
//! allowed); a client accepting only gzip gets identity even though the
//! codec is available. The allow-list wins over the client.

use axum::http::StatusCode;
use axum_test::TestServer;
use std::io::Read;
use xypriss::adapter::XyResponse;
use xypriss::config::XyPrissConfig;
use xypriss::router::handler;
use xypriss::server::XyPrissServer;

const BODY_SIZE: usize = 10 * 1024;

async fn server_allowing(algorithms: &[&str]) -> TestServer {
    let mut config = XyPrissConfig::default();
    config.server.compression.algorithms =
        algorithms.iter().map(|a| a.to_string()).collect();
    config.server.compression.threshold = 1024;

    let server = XyPrissServer::build(config).await.unwrap();
    server
        .get(
            "/big",
            handler(|_req| async move {
                let mut res = XyResponse::new();
                res.set_header("content-type", "text/plain");
                res.send("x".repeat(BODY_SIZE));
                Ok(res)
            }),
        )
        .unwrap();
    server
        .get(
            "/tiny",
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
async fn allowed_and_accepted_picks_brotli_first() {
    let client = server_allowing(&["br", "deflate"]).await;
    let response = client
        .get("/big")
        .add_header("accept-encoding", "gzip, deflate, br")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-encoding").unwrap(),
        "br"
    );

    // The body must decompress back to the original 10 KiB.
    let compressed = response.as_bytes().to_vec();
    let mut restored = Vec::new();
    brotli::Decompressor::new(compressed.as_slice(), 4096)
        .read_to_end(&mut restored)
        .unwrap();
    assert_eq!(restored.len(), BODY_SIZE);
    assert!(restored.iter().all(|b| *b == b'x'));
}

#[tokio::test]
async fn accepted_but_not_allowed_sends_identity() {
    let client = server_allowing(&["br", "deflate"]).await;
    let response = client
        .get("/big")
        .add_header("accept-encoding", "gzip")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.as_bytes().len(), BODY_SIZE);
}

#[tokio::test]
async fn deflate_is_used_when_brotli_is_not_accepted() {
    let client = server_allowing(&["br", "deflate"]).await;
    let response = client
        .get("/big")
        .add_header("accept-encoding", "gzip, deflate")
        .await;

    assert_eq!(
        response.headers().get("content-encoding").unwrap(),
        "deflate"
    );
    let mut decoder = flate2::read::ZlibDecoder::new(response.as_bytes().as_ref());
    let mut restored = Vec::new();
    decoder.read_to_end(&mut restored).unwrap();
    assert_eq!(restored.len(), BODY_SIZE);
}

#[tokio::test]
async fn bodies_at_or_below_threshold_stay_identity() {
    let client = server_allowing(&["br", "gzip", "deflate"]).await;
    let response = client
        .get("/tiny")
        .add_header("accept-encoding", "br, gzip")
        .await;
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.text(), "ok");
}
