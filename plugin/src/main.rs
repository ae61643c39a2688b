//! CSI Proxy - volume plugin binary.
//!
//! Serves the volume-plugin protocol over a Unix domain socket and runs the
//! configured CSI drivers on demand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use csi_proxy_core::config::{ProxyConfig, DEFAULT_CONFIG_PATH};
use csi_proxy_plugin::{PluginHandler, PluginServer, DEFAULT_SOCKET_PATH};
use csi_proxy_runtime::VolumeManager;

/// Volume plugin backed by CSI drivers
#[derive(Parser, Debug)]
#[command(name = "csi-proxy", version, about = "Volume plugin backed by CSI drivers")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the Unix domain socket for plugin requests.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ProxyConfig::load(&args.config)
        .map_err(|e| format!("Failed to load {}: {}", args.config.display(), e))?;

    tracing::info!(
        config = %args.config.display(),
        socket = %args.socket.display(),
        root = %config.root_dir.display(),
        node_id = %config.node_id(),
        drivers = config.drivers.len(),
        version = csi_proxy_core::VERSION,
        "Starting CSI proxy"
    );

    let manager = VolumeManager::open(config)
        .map_err(|e| format!("Failed to initialize volume registry: {}", e))?;
    let server = PluginServer::new(args.socket, PluginHandler::new(Arc::new(manager)));

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
