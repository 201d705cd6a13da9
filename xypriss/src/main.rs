//! XyPriss server binary.
//!
//! Boot order: parse arguments, load and validate configuration,
//! initialize tracing, then either run the cluster supervisor (cluster
//! enabled, not a worker) or serve directly. Workers are re-spawned
//! instances of this binary with `--worker`; they log to stderr and emit
//! heartbeat lines on stdout for the supervisor.
//!
//! Fatal boot conditions (an invalid XEMS secret, missing required
//! configuration, port exhaustion after auto-port-switch) exit non-zero
//! with a diagnostic.

use clap::Parser;
use std::sync::Arc;
use xypriss::cluster::supervisor::{spawn_heartbeat_emitter, ClusterSupervisor};
use xypriss::config::{ConfigManager, XyPrissConfig};
use xypriss::cpu_monitor::{CpuMonitor, CpuMonitorConfig};

/// Command line arguments for the XyPriss server.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "xypriss.toml")]
    config: String,

    /// Override the configured port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Internal: run as a cluster worker (set by the supervisor).
    #[arg(long, hide = true)]
    worker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing config file is only fatal when explicitly configured;
    // the default path falls back to defaults so `xypriss` runs bare.
    let mut config = if std::path::Path::new(&args.config).exists() {
        XyPrissConfig::load(&args.config)?
    } else if args.config == "xypriss.toml" {
        XyPrissConfig::default()
    } else {
        anyhow::bail!("fatal: configuration file not found: {}", args.config);
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Worker processes serve; the parent supervises when clustering.
    if config.cluster.enabled && !args.worker {
        xypriss::logging::init(&config.logging);
        let manager = ConfigManager::new(config.clone())?;
        let _ = xypriss::config::init_global(manager);

        let cpu = Arc::new(CpuMonitor::new(CpuMonitorConfig::default()));
        let supervisor = ClusterSupervisor::new(config.cluster.clone(), cpu, args.config.clone());
        return supervisor.run().await;
    }

    if args.worker {
        // Heartbeats own stdout; logging moves to stderr inside run().
        let _heartbeat = spawn_heartbeat_emitter(config.cluster.heartbeat_interval);
    }

    xypriss::server::run(config, args.worker).await
}
