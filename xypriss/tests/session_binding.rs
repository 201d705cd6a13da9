//! XEMS HTTP binding: token extraction, attachment, and rotation
//! injection before the first body byte.

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use xypriss::adapter::XyResponse;
use xypriss::config::XyPrissConfig;
use xypriss::router::handler;
use xypriss::security::xems::XemsStore;
use xypriss::server::XyPrissServer;

async fn session_server() -> (TestServer, Arc<XemsStore>) {
    let mut config = XyPrissConfig::default();
    config.xems.enabled = true;
    config.xems.secret = Some("cd".repeat(32));
    config.xems.auto_rotation = true;
    config.xems.grace_period = Duration::from_secs(1);

    let server = XyPrissServer::build(config).await.unwrap();
    server
        .get(
            "/me",
            handler(|req| async move {
                let mut res = XyResponse::new();
                match &req.session {
                    Some(session) => {
                        res.json(session)?;
                    }
                    None => {
                        res.status(401).send("no session");
                    }
                }
                Ok(res)
            }),
        )
        .unwrap();
    server.state().registry.initialize().await.unwrap();
    let store = server.state().xems.as_ref().unwrap().clone();
    (TestServer::new(server.app()).unwrap(), store)
}

#[tokio::test]
async fn cookie_token_resolves_and_rotates_in_the_response() {
    let (client, store) = session_server().await;
    let t0 = store
        .create_session("web", &json!({"user": "u1"}), None)
        .unwrap();

    let response = client
        .get("/me")
        .add_header("cookie", format!("xems_token={t0}"))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<serde_json::Value>()["user"], "u1");

    // Rotation surfaces in both the header and the cookie.
    let t1 = response
        .headers()
        .get("x-xypriss-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(t0, t1);

    let set_cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.contains(&format!("xems_token={t1}")));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Strict"));
}

#[tokio::test]
async fn header_token_is_accepted_too() {
    let (client, store) = session_server().await;
    let t0 = store
        .create_session("web", &json!({"user": "u2"}), None)
        .unwrap();

    let response = client
        .get("/me")
        .add_header("x-xypriss-token", t0.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<serde_json::Value>()["user"], "u2");
}

#[tokio::test]
async fn rotated_token_keeps_working_and_old_one_expires() {
    let (client, store) = session_server().await;
    let t0 = store
        .create_session("web", &json!({"user": "u3"}), None)
        .unwrap();

    let first = client
        .get("/me")
        .add_header("x-xypriss-token", t0.clone())
        .await;
    let t1 = first
        .headers()
        .get("x-xypriss-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // The replacement resolves (and rotates again).
    let second = client
        .get("/me")
        .add_header("x-xypriss-token", t1.clone())
        .await;
    assert_eq!(second.status_code(), StatusCode::OK);

    // Outside the grace window the original token is dead.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let stale = client
        .get("/me")
        .add_header("x-xypriss-token", t0.clone())
        .await;
    assert_eq!(stale.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_token_reaches_the_handler_without_a_session() {
    let (client, _store) = session_server().await;
    let response = client.get("/me").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text(), "no session");
}
