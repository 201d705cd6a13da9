//! Minimal XyPriss server: two routes, browser-only protection, and the
//! built-in security-headers plugin.
//!
//! ```bash
//! cargo run --example basic_server
//! curl -H 'User-Agent: curl/8.0' http://127.0.0.1:8080/   # blocked
//! ```

use std::collections::HashMap;
use xypriss::adapter::XyResponse;
use xypriss::config::{PluginRegistrationSection, XyPrissConfig};
use xypriss::router::handler;
use xypriss::server::XyPrissServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = XyPrissConfig::default();
    config.server.port = 8080;
    config.security.browser_only.enabled = true;
    config.plugins.register = vec![PluginRegistrationSection {
        name: "security-headers".to_string(),
        enabled: true,
        config: HashMap::new(),
    }];

    xypriss::logging::init(&config.logging);
    let server = XyPrissServer::build(config).await?;

    server.get(
        "/",
        handler(|_req| async move {
            let mut res = XyResponse::new();
            res.send("hello from xypriss");
            Ok(res)
        }),
    )?;

    server.get(
        "/users/:id",
        handler(|req| async move {
            let mut res = XyResponse::new();
            res.json(&serde_json::json!({
                "user": req.param("id"),
                "xhr": req.xhr(),
            }))?;
            Ok(res)
        }),
    )?;

    server.serve().await
}
