//! XyPriss as a reverse proxy: `/api/*` is balanced across two
//! upstreams with ip-hash stickiness and active health checks, while
//! local routes keep serving.

use std::time::Duration;
use xypriss::adapter::XyResponse;
use xypriss::config::{ProxyRouteSection, XyPrissConfig};
use xypriss::router::handler;
use xypriss::server::XyPrissServer;
use xypriss_net::{BalanceStrategy, Upstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = XyPrissConfig::default();
    config.server.port = 8080;
    config.proxy.enabled = true;
    config.proxy.routes = vec![ProxyRouteSection {
        prefix: "/api/".to_string(),
        upstreams: vec![
            Upstream::new("127.0.0.1", 9001),
            Upstream::new("127.0.0.1", 9002).with_weight(2),
        ],
        strategy: BalanceStrategy::IpHash,
        retries: 2,
        timeout: Duration::from_secs(10),
    }];

    xypriss::logging::init(&config.logging);
    let server = XyPrissServer::build(config).await?;

    server.get(
        "/",
        handler(|_req| async move {
            let mut res = XyResponse::new();
            res.send("gateway up; /api/* proxies to the backend pool");
            Ok(res)
        }),
    )?;

    server.serve().await
}
