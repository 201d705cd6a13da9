//! Fixed-window rate limiting through the assembled pipeline.

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;
use std::collections::HashMap;
use xypriss::adapter::XyResponse;
use xypriss::config::{PluginRegistrationSection, XyPrissConfig};
use xypriss::router::handler;
use xypriss::server::XyPrissServer;

async fn limited_server(max_requests: u64) -> TestServer {
    let mut config = XyPrissConfig::default();
    config.plugins.register = vec![PluginRegistrationSection {
        name: "rate-limit".to_string(),
        enabled: true,
        config: HashMap::from([
            ("maxRequests".to_string(), Value::Number(max_requests.into())),
            ("window".to_string(), Value::String("30s".to_string())),
        ]),
    }];

    let server = XyPrissServer::build(config).await.unwrap();
    server
        .get(
            "/data",
            handler(|_req| async move {
                let mut res = XyResponse::new();
                res.send("payload");
                Ok(res)
            }),
        )
        .unwrap();
    server.state().registry.initialize().await.unwrap();
    TestServer::new(server.app()).unwrap()
}

#[tokio::test]
async fn window_count_never_exceeds_max_plus_one() {
    let max = 5u64;
    let client = limited_server(max).await;

    let mut served = 0u64;
    for _ in 0..20 {
        let response = client.get("/data").await;
        match response.status_code() {
            StatusCode::OK => served += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                let body = response.json::<Value>();
                assert_eq!(body["status"], 429);
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(served <= max + 1, "served {served} > max + 1");
    assert!(served >= max, "served {served} < max");
}

#[tokio::test]
async fn requests_under_the_limit_flow_through() {
    let client = limited_server(100).await;
    for _ in 0..10 {
        let response = client.get("/data").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), "payload");
    }
}
